//! Spill threshold scenario at the documented 32 KiB boundary.
//!
//! Hermetic (no database); runs with the normal test suite.

use futures::StreamExt;

use objectstack_storage::HashingSink;

const LIMIT: usize = 32 * 1024;

fn spill_dirs(root: &std::path::Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with("hashspill-"))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_should_not_spill_at_exactly_32_kib() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = vec![0xAB_u8; LIMIT];

    let mut sink = HashingSink::new(LIMIT, tmp.path());
    sink.write(&data).await.expect("write");
    sink.finish().await.expect("finish");

    assert!(!sink.is_spilled());
    assert_eq!(spill_dirs(tmp.path()), 0);
    assert_eq!(
        sink.digest_hex().expect("digest"),
        {
            use sha2::Digest;
            hex::encode(sha2::Sha256::digest(&data))
        }
    );
}

#[tokio::test]
async fn test_should_spill_one_byte_past_32_kib_and_auto_clean() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = vec![0xAB_u8; LIMIT + 1];

    let mut sink = HashingSink::new(LIMIT, tmp.path());
    sink.write(&data).await.expect("write");
    sink.finish().await.expect("finish");

    assert!(sink.is_spilled());
    assert_eq!(spill_dirs(tmp.path()), 1, "exactly one hashspill directory");

    // Drain an auto-cleanup reader; artifacts disappear with it.
    let mut reader = sink.to_readable(true).await.expect("reader");
    let mut replay = Vec::new();
    while let Some(chunk) = reader.next().await {
        replay.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(replay, data);
    assert_eq!(spill_dirs(tmp.path()), 0, "auto cleanup after drain");
}
