mod common;

use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use genome_fetch::acquire::{Acquirer, KindOutcome, ProgressEvent};
use genome_fetch::domain::AssetKind;
use genome_fetch::error::ErrorClass;
use genome_fetch::store::Layout;

use common::{
    MockArchive, MockEntry, RecordingSink, ensembl_request, fasta_text, file_names, gtf_text,
    gzip, options, temp_root,
};

const SEQUENCE_GZ: &str = "Homo_sapiens.GRCh38.dna_sm.toplevel.fa.gz";
const SEQUENCE: &str = "Homo_sapiens.GRCh38.dna_sm.toplevel.fa";
const ANNOTATION_GZ: &str = "Homo_sapiens.GRCh38.113.gtf.gz";
const ANNOTATION: &str = "Homo_sapiens.GRCh38.113.gtf";

fn release_dir(root: &Utf8PathBuf) -> Utf8PathBuf {
    root.join("ensembl/primates/homo_sapiens/113")
}

#[test]
fn fresh_run_places_decompressed_verified_files() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let sink = RecordingSink::default();

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &sink);

    assert!(result.success());
    assert_eq!(result.kinds_obtained(), AssetKind::ALL.to_vec());
    let dir = release_dir(&root);
    assert_eq!(result.directory, dir);
    assert_eq!(file_names(&dir), vec![ANNOTATION, SEQUENCE]);
    assert_eq!(
        fs::read_to_string(dir.join(SEQUENCE).as_std_path()).unwrap(),
        fasta_text("homo_sapiens")
    );
    assert_eq!(
        fs::read_to_string(dir.join(ANNOTATION).as_std_path()).unwrap(),
        gtf_text("homo_sapiens")
    );
    assert_eq!(archive.transfers(), 2);

    let events = sink.events();
    assert!(matches!(events.first(), Some(ProgressEvent::SpeciesStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::SpeciesFinished { success: true, .. })
    ));
    let finalized = events
        .iter()
        .filter(|event| matches!(event, ProgressEvent::Finalized { .. }))
        .count();
    assert_eq!(finalized, 2);
}

#[test]
fn second_run_does_no_remote_work() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let request = ensembl_request("homo_sapiens");

    let first = acquirer.acquire(&request, &RecordingSink::default());
    assert!(first.success());
    let sink = RecordingSink::default();
    let second = acquirer.acquire(&request, &sink);

    assert!(second.success());
    assert_eq!(second.outcomes, first.outcomes);
    assert_eq!(archive.transfers(), 2);
    assert_eq!(archive.connects(), 1);
    let satisfied = sink
        .events()
        .iter()
        .filter(|event| matches!(event, ProgressEvent::AlreadySatisfied { .. }))
        .count();
    assert_eq!(satisfied, 2);
}

#[test]
fn force_fetches_everything_again() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    let request = ensembl_request("homo_sapiens");
    Acquirer::new(archive.clone(), Layout::new(root.clone()), options())
        .acquire(&request, &RecordingSink::default());

    let mut forced = options();
    forced.force = true;
    let result = Acquirer::new(archive.clone(), Layout::new(root.clone()), forced)
        .acquire(&request, &RecordingSink::default());

    assert!(result.success());
    assert_eq!(archive.transfers(), 4);
    assert_eq!(file_names(&release_dir(&root)), vec![ANNOTATION, SEQUENCE]);
}

#[test]
fn corrupted_transfer_is_refetched() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.corrupt(SEQUENCE_GZ, 1);
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let sink = RecordingSink::default();

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &sink);

    assert!(result.success());
    assert_eq!(archive.transfers(), 3);
    let mismatches = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::ChecksumMismatch { file, attempt, .. } => Some((file, attempt)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(mismatches, vec![(SEQUENCE_GZ.to_string(), 1)]);
    assert_eq!(
        fs::read_to_string(release_dir(&root).join(SEQUENCE).as_std_path()).unwrap(),
        fasta_text("homo_sapiens")
    );
}

#[test]
fn persistent_corruption_fails_only_that_kind() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.corrupt(ANNOTATION_GZ, 10);
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert!(!result.success());
    assert_matches!(
        result.outcomes[&AssetKind::Sequence],
        KindOutcome::Obtained { .. }
    );
    assert_matches!(
        result.outcomes[&AssetKind::Annotation],
        KindOutcome::Failed {
            error: ErrorClass::ChecksumMismatch,
            ..
        }
    );
    // one sequence transfer plus three annotation attempts
    assert_eq!(archive.transfers(), 4);
    assert_eq!(file_names(&release_dir(&root)), vec![SEQUENCE]);
    assert!(result.failure_reason().unwrap().starts_with("annotation: "));
}

#[test]
fn file_missing_from_manifest_is_never_transferred() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.insert(
        "homo_sapiens",
        AssetKind::Annotation,
        MockEntry::Available {
            name: ANNOTATION_GZ.to_string(),
            payload: gzip(gtf_text("homo_sapiens").as_bytes()),
            listed: false,
            extra_candidates: Vec::new(),
        },
    );
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert_matches!(
        result.outcomes[&AssetKind::Annotation],
        KindOutcome::Failed {
            error: ErrorClass::Unverifiable,
            ..
        }
    );
    assert_eq!(archive.transfers(), 1);
    assert_eq!(file_names(&release_dir(&root)), vec![SEQUENCE]);
}

#[test]
fn unpublished_annotation_is_remembered() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.insert("homo_sapiens", AssetKind::Annotation, MockEntry::NotAvailable);
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let request = ensembl_request("homo_sapiens");

    let result = acquirer.acquire(&request, &RecordingSink::default());
    assert!(result.success());
    assert_eq!(result.outcomes[&AssetKind::Annotation], KindOutcome::NotAvailable);
    assert_eq!(result.kinds_obtained(), vec![AssetKind::Sequence]);
    assert_eq!(
        file_names(&release_dir(&root)),
        vec![SEQUENCE, "annotation.unavailable"]
    );

    let again = acquirer.acquire(&request, &RecordingSink::default());
    assert_eq!(again.outcomes[&AssetKind::Annotation], KindOutcome::NotAvailable);
    assert_eq!(archive.connects(), 1);
}

#[test]
fn connection_failure_fails_every_kind_and_leaves_no_directory() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.make_unreachable("homo_sapiens");
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert!(!result.success());
    for kind in AssetKind::ALL {
        assert_matches!(
            result.outcomes[&kind],
            KindOutcome::Failed {
                error: ErrorClass::ConnectFailed,
                ..
            }
        );
    }
    assert_eq!(archive.transfers(), 0);
    assert!(!root.join("ensembl/primates/homo_sapiens").as_std_path().exists());
}

#[test]
fn verified_intermediate_is_finalized_without_transfer() {
    let (_temp, root) = temp_root();
    let payload = gzip(fasta_text("homo_sapiens").as_bytes());
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.insert(
        "homo_sapiens",
        AssetKind::Sequence,
        MockEntry::Available {
            name: SEQUENCE_GZ.to_string(),
            payload: payload.clone(),
            listed: true,
            extra_candidates: Vec::new(),
        },
    );
    let dir = release_dir(&root);
    fs::create_dir_all(dir.as_std_path()).unwrap();
    fs::write(dir.join(SEQUENCE_GZ).as_std_path(), &payload).unwrap();
    fs::write(dir.join(format!("{ANNOTATION_GZ}.part")).as_std_path(), b"half a download").unwrap();
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert!(result.success());
    assert_eq!(archive.transfers(), 1);
    assert_eq!(file_names(&dir), vec![ANNOTATION, SEQUENCE]);
}

#[test]
fn stale_intermediate_is_replaced() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    let dir = release_dir(&root);
    fs::create_dir_all(dir.as_std_path()).unwrap();
    fs::write(dir.join(SEQUENCE_GZ).as_std_path(), b"truncated").unwrap();
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert!(result.success());
    assert_eq!(archive.transfers(), 2);
    assert_eq!(
        fs::read_to_string(dir.join(SEQUENCE).as_std_path()).unwrap(),
        fasta_text("homo_sapiens")
    );
}

#[test]
fn several_candidates_use_the_first_and_say_so() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.insert(
        "homo_sapiens",
        AssetKind::Sequence,
        MockEntry::Available {
            name: SEQUENCE_GZ.to_string(),
            payload: gzip(fasta_text("homo_sapiens").as_bytes()),
            listed: true,
            extra_candidates: vec!["Homo_sapiens.GRCh37.dna_sm.toplevel.fa.gz".to_string()],
        },
    );
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let sink = RecordingSink::default();

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &sink);

    assert!(result.success());
    let chosen = sink.events().into_iter().find_map(|event| match event {
        ProgressEvent::MultipleCandidates {
            chosen, candidates, ..
        } => Some((chosen, candidates.len())),
        _ => None,
    });
    assert_eq!(chosen, Some((SEQUENCE_GZ.to_string(), 2)));
}

#[test]
fn undecompressable_download_keeps_the_intermediate() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.insert(
        "homo_sapiens",
        AssetKind::Annotation,
        MockEntry::Available {
            name: ANNOTATION_GZ.to_string(),
            payload: b"not gzip at all".to_vec(),
            listed: true,
            extra_candidates: Vec::new(),
        },
    );
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert_matches!(
        result.outcomes[&AssetKind::Annotation],
        KindOutcome::Failed {
            error: ErrorClass::DecompressFailed,
            ..
        }
    );
    assert_eq!(file_names(&release_dir(&root)), vec![ANNOTATION_GZ, SEQUENCE]);
}

#[test]
fn single_kind_request_leaves_other_kind_alone() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let request = ensembl_request("homo_sapiens").with_kinds([AssetKind::Annotation]);

    let result = acquirer.acquire(&request, &RecordingSink::default());

    assert!(result.success());
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(archive.transfers(), 1);
    assert_eq!(file_names(&release_dir(&root)), vec![ANNOTATION]);
}

#[test]
fn interrupted_transfer_is_retried_from_scratch() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.interrupt(SEQUENCE_GZ, 1);
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());
    let sink = RecordingSink::default();

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &sink);

    assert!(result.success());
    assert_eq!(archive.transfers(), 3);
    let failures = sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, ProgressEvent::TransferFailed { attempt: 1, .. }))
        .count();
    assert_eq!(failures, 1);
    assert_eq!(
        fs::read_to_string(release_dir(&root).join(SEQUENCE).as_std_path()).unwrap(),
        fasta_text("homo_sapiens")
    );
    assert_eq!(file_names(&release_dir(&root)), vec![ANNOTATION, SEQUENCE]);
}

#[test]
fn repeated_interruption_leaves_nothing_at_the_final_path() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.interrupt(ANNOTATION_GZ, 10);
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert_matches!(
        result.outcomes[&AssetKind::Sequence],
        KindOutcome::Obtained { .. }
    );
    assert_matches!(
        result.outcomes[&AssetKind::Annotation],
        KindOutcome::Failed {
            error: ErrorClass::TransferFailed,
            ..
        }
    );
    assert_eq!(archive.transfers(), 1 + 3);
    // neither the final GTF, its intermediate, nor a half-written .part survives
    assert_eq!(file_names(&release_dir(&root)), vec![SEQUENCE]);
}

#[test]
fn unresolvable_kind_does_not_block_the_other() {
    let (_temp, root) = temp_root();
    let archive = MockArchive::new().with_standard_species("homo_sapiens");
    archive.withdraw("homo_sapiens", AssetKind::Annotation);
    let acquirer = Acquirer::new(archive.clone(), Layout::new(root.clone()), options());

    let result = acquirer.acquire(&ensembl_request("homo_sapiens"), &RecordingSink::default());

    assert!(!result.success());
    assert_matches!(
        result.outcomes[&AssetKind::Annotation],
        KindOutcome::Failed {
            error: ErrorClass::ResolveFailed,
            ..
        }
    );
    assert_eq!(result.kinds_obtained(), vec![AssetKind::Sequence]);
    assert_eq!(archive.transfers(), 1);
    assert_eq!(file_names(&release_dir(&root)), vec![SEQUENCE]);
}
