use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use genome_fetch::acquire::{AcquireOptions, Acquirer};
use genome_fetch::archive::ArchiveConnector;
use genome_fetch::archive::ensembl::{EnsemblConfig, EnsemblConnector};
use genome_fetch::archive::ncbi::{NcbiConfig, NcbiConnector};
use genome_fetch::config::{ConfigLoader, Overrides, ResolvedConfig, RunSettings, SpeciesTarget};
use genome_fetch::domain::{AssemblySource, AssetKind, AssetRequest, Division, Release, Source};
use genome_fetch::error::AcquireError;
use genome_fetch::fetch::RetryPolicy;
use genome_fetch::output::{BatchReport, JsonOutput, LogSink};
use genome_fetch::scheduler;
use genome_fetch::species::{ExplicitSpecies, NcbiSpeciesSearch, SpeciesFile, SpeciesSource};
use genome_fetch::store::Layout;

const DEFAULT_RELEASE: Release = Release::Numbered(113);
const EXIT_SPECIES_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "genome-fetch")]
#[command(about = "Download checksum-verified genome FASTA and GTF files from Ensembl or NCBI")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch assets from the Ensembl FTP site")]
    Ensembl(EnsemblArgs),
    #[command(about = "Fetch assets through the NCBI Datasets CLI")]
    Ncbi(NcbiArgs),
    #[command(about = "List species known to NCBI Datasets for a search term")]
    Species(SearchArgs),
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Asset kinds to fetch.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    kinds: Option<Vec<AssetKind>>,

    /// Output root directory [default: genomes]
    #[arg(short, long)]
    output: Option<Utf8PathBuf>,

    /// Number of species processed in parallel [default: 1]
    #[arg(short, long)]
    processes: Option<usize>,

    /// Attempts per transfer before giving up [default: 3]
    #[arg(short = 'a', long)]
    max_attempts: Option<u32>,

    /// Ignore files already present and fetch again.
    #[arg(long)]
    force: bool,

    /// JSON batch config [default: genome-fetch.json when present]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the batch report as JSON.
    #[arg(long)]
    json: bool,
}

impl CommonArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            output: self.output.clone(),
            processes: self.processes,
            max_attempts: self.max_attempts,
            force: self.force,
            kinds: self.kinds.clone(),
        }
    }
}

#[derive(Args, Clone)]
struct EnsemblArgs {
    /// Species names, e.g. homo_sapiens.
    #[arg(short, long, num_args = 1.., conflicts_with = "file")]
    species: Vec<String>,

    /// File with one species per line.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Release number or "current" [default: 113]
    #[arg(short, long)]
    release: Option<Release>,

    /// Ensembl division [default: primates]
    #[arg(short, long, value_enum)]
    division: Option<Division>,

    /// Suffix that selects the sequence file [default: dna_sm.toplevel.fa.gz]
    #[arg(long)]
    sequence_suffix: Option<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Clone)]
struct NcbiSelection {
    /// NCBI search term used to discover species.
    #[arg(long)]
    search: Option<String>,

    /// Maximum number of species taken from a search.
    #[arg(short, long, default_value_t = 1)]
    max_species: usize,

    /// Assembly source [default: all]
    #[arg(long, value_enum)]
    assembly_source: Option<AssemblySource>,

    /// Include non-reference assemblies.
    #[arg(long)]
    no_reference: bool,

    /// Write the names found by --search to this file.
    #[arg(long)]
    species_list_file: Option<Utf8PathBuf>,

    /// Path to the datasets binary [default: looked up on PATH]
    #[arg(long)]
    datasets: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct NcbiArgs {
    /// Species names or taxon ids.
    #[arg(short, long, num_args = 1.., conflicts_with_all = ["file", "search"])]
    species: Vec<String>,

    /// File with one species per line.
    #[arg(short, long, conflicts_with = "search")]
    file: Option<PathBuf>,

    #[command(flatten)]
    selection: NcbiSelection,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Clone)]
struct SearchArgs {
    #[command(flatten)]
    selection: NcbiSelection,

    /// Print the names as a JSON array.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<AcquireError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &AcquireError) -> u8 {
    match error {
        AcquireError::InvalidSpecies(_)
        | AcquireError::InvalidRelease(_)
        | AcquireError::InvalidKind(_)
        | AcquireError::InvalidDivision(_)
        | AcquireError::ConfigRead(_)
        | AcquireError::ConfigParse(_)
        | AcquireError::SpeciesList { .. } => 2,
        AcquireError::MissingTool(_)
        | AcquireError::ConnectFailed { .. }
        | AcquireError::ResolveFailed { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ensembl(args) => run_ensembl(args),
        Commands::Ncbi(args) => run_ncbi(args),
        Commands::Species(args) => run_species(args),
    }
}

fn run_ensembl(args: EnsemblArgs) -> miette::Result<u8> {
    let config = ConfigLoader::resolve(args.common.config.as_deref())?;
    let settings = RunSettings::merge(&args.common.overrides(), config.as_ref())?;
    let section = config.as_ref().map(|config| &config.ensembl);

    let release = args
        .release
        .or_else(|| section.and_then(|section| section.release))
        .unwrap_or(DEFAULT_RELEASE);
    let division = args
        .division
        .or_else(|| section.and_then(|section| section.division))
        .unwrap_or(Division::Primates);

    let mut ensembl = EnsemblConfig {
        retry: retry_policy(&settings),
        ..EnsemblConfig::default()
    };
    if let Some(suffix) = args
        .sequence_suffix
        .clone()
        .or_else(|| section.and_then(|section| section.sequence_suffix.clone()))
    {
        ensembl.sequence_suffix = suffix;
    }
    if let Some(site) = section.and_then(|section| section.main_site.clone()) {
        ensembl.main_site = site;
    }
    if let Some(site) = section.and_then(|section| section.genomes_site.clone()) {
        ensembl.genomes_site = site;
    }

    let explicit: Option<Box<dyn SpeciesSource>> = if !args.species.is_empty() {
        Some(Box::new(ExplicitSpecies::new(args.species.clone())))
    } else {
        args.file
            .clone()
            .map(|path| Box::new(SpeciesFile::new(path)) as Box<dyn SpeciesSource>)
    };
    let targets = species_targets(explicit.as_deref(), config.as_ref())?;

    let source = Source::Ensembl(division);
    let requests = build_requests(targets, &settings, source, release);
    execute(EnsemblConnector::new(ensembl), requests, &settings, source, args.common.json)
}

fn run_ncbi(args: NcbiArgs) -> miette::Result<u8> {
    let config = ConfigLoader::resolve(args.common.config.as_deref())?;
    let settings = RunSettings::merge(&args.common.overrides(), config.as_ref())?;
    let section = config.as_ref().map(|config| &config.ncbi);

    let assembly = args
        .selection
        .assembly_source
        .or_else(|| section.and_then(|section| section.assembly_source))
        .unwrap_or_default();
    let reference = !args.selection.no_reference
        && section.and_then(|section| section.reference).unwrap_or(true);
    let datasets = args
        .selection
        .datasets
        .clone()
        .or_else(|| section.and_then(|section| section.datasets.clone()));

    let connector = NcbiConnector::new(NcbiConfig {
        datasets: datasets.clone(),
        reference,
        retry: retry_policy(&settings),
        ..NcbiConfig::default()
    });
    connector.require_datasets()?;

    let explicit: Option<Box<dyn SpeciesSource>> = if !args.species.is_empty() {
        Some(Box::new(ExplicitSpecies::new(args.species.clone())))
    } else if let Some(path) = args.file.clone() {
        Some(Box::new(SpeciesFile::new(path)))
    } else {
        args.selection.search.as_ref().map(|term| {
            Box::new(search_for(term, &args.selection, assembly, reference, datasets.clone()))
                as Box<dyn SpeciesSource>
        })
    };
    let targets = species_targets(explicit.as_deref(), config.as_ref())?;

    let source = Source::Ncbi(assembly);
    let requests = build_requests(targets, &settings, source, Release::Current);
    execute(connector, requests, &settings, source, args.common.json)
}

fn run_species(args: SearchArgs) -> miette::Result<u8> {
    let term = args
        .selection
        .search
        .clone()
        .unwrap_or_else(|| "all".to_string());
    let search = search_for(
        &term,
        &args.selection,
        args.selection.assembly_source.unwrap_or_default(),
        !args.selection.no_reference,
        args.selection.datasets.clone(),
    );
    let names = search
        .species()?
        .into_iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    if args.json {
        JsonOutput::print_species(&names).into_diagnostic()?;
    } else {
        for name in &names {
            println!("{name}");
        }
    }
    Ok(0)
}

fn search_for(
    term: &str,
    selection: &NcbiSelection,
    assembly: AssemblySource,
    reference: bool,
    datasets: Option<PathBuf>,
) -> NcbiSpeciesSearch {
    NcbiSpeciesSearch::new(term, selection.max_species)
        .with_datasets(datasets)
        .with_assembly_source(assembly)
        .with_reference(reference)
        .with_list_file(selection.species_list_file.clone())
}

/// Species from the command line win over species listed in the config file.
fn species_targets(
    explicit: Option<&dyn SpeciesSource>,
    config: Option<&ResolvedConfig>,
) -> miette::Result<Vec<SpeciesTarget>> {
    let targets = match explicit {
        Some(source) => source
            .species()?
            .into_iter()
            .map(SpeciesTarget::named)
            .collect::<Vec<_>>(),
        None => config
            .map(|config| config.species.clone())
            .unwrap_or_default(),
    };
    if targets.is_empty() {
        return Err(AcquireError::InvalidSpecies(
            "no species given (use --species, --file, --search or a config file)".to_string(),
        )
        .into());
    }
    Ok(targets)
}

fn build_requests(
    targets: Vec<SpeciesTarget>,
    settings: &RunSettings,
    source: Source,
    release: Release,
) -> Vec<AssetRequest> {
    targets
        .into_iter()
        .map(|target| {
            let kinds: BTreeSet<AssetKind> = target.kinds.unwrap_or_else(|| settings.kinds.clone());
            let release = match source {
                Source::Ensembl(_) => target.release.unwrap_or(release),
                Source::Ncbi(_) => Release::Current,
            };
            AssetRequest::new(target.name, kinds, source, release)
        })
        .collect()
}

fn retry_policy(settings: &RunSettings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: settings.max_attempts,
        ..RetryPolicy::default()
    }
}

fn execute<C: ArchiveConnector>(
    connector: C,
    requests: Vec<AssetRequest>,
    settings: &RunSettings,
    source: Source,
    json: bool,
) -> miette::Result<u8> {
    let options = AcquireOptions {
        force: settings.force,
        retry: retry_policy(settings),
        ..AcquireOptions::default()
    };
    let acquirer = Acquirer::new(connector, Layout::new(settings.output.clone()), options);

    let started_at = Utc::now();
    let results = scheduler::run(&acquirer, requests, settings.processes, &LogSink);
    let report = BatchReport::new(source.to_string(), started_at, Utc::now(), results);

    if json {
        JsonOutput::print_report(&report).into_diagnostic()?;
    } else {
        print!("{}", report.render_text());
    }
    if report.all_succeeded() {
        Ok(0)
    } else {
        Ok(EXIT_SPECIES_FAILED)
    }
}
