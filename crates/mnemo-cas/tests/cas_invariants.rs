//! Cross-cutting CAS invariants (§8) exercised against a real directory on
//! disk, as distinct from the in-crate unit tests covering the same store's
//! individual methods.

use mnemo_cas::{ContentStore, Error, VerifyOutcome, MAX_BLOB_BYTES};

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn temp_store() -> (tempfile::TempDir, ContentStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();
    (dir, store)
}

#[test]
fn digest_identity_and_idempotent_store() -> TestResult {
    let (_dir, store) = temp_store();
    let data = b"hello world".to_vec();

    let d1 = store.store(&data)?;
    let d2 = store.store(&data)?;
    assert_eq!(d1, d2);
    assert_eq!(store.stats()?.total_files, 1);
    Ok(())
}

#[test]
fn round_trip_integrity() -> TestResult {
    let (_dir, store) = temp_store();
    let data = vec![0xABu8; 128 * 1024];
    let digest = store.store(&data)?;
    let got = store.get_verified(&digest)?.unwrap();
    assert_eq!(got, data);
    Ok(())
}

#[test]
fn tampered_blob_is_distinguishable_from_missing() -> TestResult {
    let (dir, store) = temp_store();
    let digest = store.store(b"original content")?;
    let hex = digest.strip_prefix("sha256:").unwrap();
    std::fs::write(dir.path().join("content").join(hex), b"mutated bytes!!")?;

    assert_eq!(store.verify(&digest)?, VerifyOutcome::Tampered);
    assert!(matches!(store.get_verified(&digest), Err(Error::Tampered(_))));

    // A blob that was never written (or was redacted) is Missing, not Tampered.
    store.delete(&digest)?;
    assert_eq!(store.verify(&digest)?, VerifyOutcome::Missing);
    assert!(store.get_verified(&digest)?.is_none());
    Ok(())
}

#[test]
fn oversized_blob_is_rejected_before_touching_disk() -> TestResult {
    let (_dir, store) = temp_store();
    let too_big = vec![0u8; MAX_BLOB_BYTES + 1];
    let err = store.store(&too_big).unwrap_err();
    assert!(matches!(err, Error::TooLarge(n) if n == MAX_BLOB_BYTES + 1));
    assert_eq!(store.stats()?.total_files, 0);
    Ok(())
}

#[test]
fn empty_blob_round_trips_like_any_other() -> TestResult {
    let (_dir, store) = temp_store();
    let digest = store.store(&[])?;
    assert!(store.exists(&digest));
    assert_eq!(store.get(&digest)?.unwrap(), Vec::<u8>::new());
    Ok(())
}

#[test]
fn stats_reflect_deletes_and_ignore_in_flight_temp_files() -> TestResult {
    let (dir, store) = temp_store();
    let d1 = store.store(b"one")?;
    store.store(b"two")?;
    assert_eq!(store.stats()?.total_files, 2);

    // An in-flight write-temp file (as `store` briefly creates before rename)
    // must not be counted.
    std::fs::write(dir.path().join("content").join(".stray.tmp"), b"partial")?;
    assert_eq!(store.stats()?.total_files, 2);

    store.delete(&d1)?;
    assert_eq!(store.stats()?.total_files, 1);
    Ok(())
}

#[test]
fn same_bytes_produce_the_same_digest_across_independent_stores() -> TestResult {
    let (_d1, store1) = temp_store();
    let (_d2, store2) = temp_store();
    let data = vec![0x5Au8; 64 * 1024];

    let digest1 = store1.store(&data)?;
    let digest2 = store2.store(&data)?;
    assert_eq!(digest1, digest2);
    Ok(())
}
