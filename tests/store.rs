use std::fs;

use camino::Utf8PathBuf;

use genome_fetch::domain::{AssetKind, AssetRequest, Division, Release, Source};
use genome_fetch::store::{self, Layout, LocalState};

#[test]
fn layout_paths() {
    let layout = Layout::new("/srv/genomes");
    let request = AssetRequest::new(
        "Oryza sativa".parse().unwrap(),
        AssetKind::ALL,
        Source::Ensembl(Division::Plants),
        Release::Current,
    );

    assert_eq!(
        layout.species_dir(&request),
        Utf8PathBuf::from("/srv/genomes/ensembl/plants/oryza_sativa")
    );
    assert!(layout.release_dir(&request).ends_with("oryza_sativa/current"));
    assert!(layout.staging_dir(&request).ends_with("current/.staging"));
}

#[test]
fn superseded_candidates_are_removed() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    for name in ["a.dna.toplevel.fa", "a.dna_sm.toplevel.fa.gz", "a.113.gtf", "README.sequence"] {
        fs::write(dir.join(name).as_std_path(), b"x").unwrap();
    }
    let keep = dir.join("a.dna_sm.toplevel.fa");
    fs::write(keep.as_std_path(), b">1\n").unwrap();

    store::remove_other_candidates(&dir, AssetKind::Sequence, &keep).unwrap();

    let assets = store::inspect(&dir, "a", AssetKind::ALL).unwrap();
    assert_eq!(assets[&AssetKind::Sequence].state, LocalState::Final(keep));
    assert!(assets[&AssetKind::Annotation].verified());
    assert!(dir.join("README.sequence").as_std_path().exists());
    assert!(!dir.join("a.dna.toplevel.fa").as_std_path().exists());
}

#[test]
fn atomic_writes_leave_no_partial() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().join("nested")).unwrap();
    let target = dir.join("list.txt");

    store::write_bytes_atomic(&target, b"homo_sapiens\n").unwrap();
    let copy = dir.join("copy.txt");
    store::copy_file_atomic(&target, &copy).unwrap();

    assert_eq!(fs::read_to_string(copy.as_std_path()).unwrap(), "homo_sapiens\n");
    assert!(!store::partial_path(&target).as_std_path().exists());
    assert_eq!(store::remove_partials(&dir).unwrap(), 0);
}
