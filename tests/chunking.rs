//! Chunked output: reassembly, integrity failures and cleanup

use s_tar::chunk::{manifest_path, part_path};
use s_tar::{
    compress, decompress, list_contents, Algorithm, Artifact, ChunkManifest, CompressOptions,
    DecompressOptions, PipeConfig, ProgressEvent, Result, STarError, Sink, Source,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// Deterministic, poorly compressible bytes
fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn make_data_dir(root: &Path) -> PathBuf {
    let data = root.join("data");
    fs::create_dir_all(data.join("deeper")).unwrap();
    fs::write(data.join("a.bin"), noise(150_000, 1)).unwrap();
    fs::write(data.join("b.txt"), "plain text\n".repeat(5_000)).unwrap();
    fs::write(data.join("deeper/c.bin"), noise(70_000, 2)).unwrap();
    data
}

fn concat_parts(prefix: &Path, manifest: &ChunkManifest) -> Vec<u8> {
    let mut joined = Vec::new();
    for info in &manifest.chunks {
        joined.extend(fs::read(part_path(prefix, info.index)).unwrap());
    }
    joined
}

async fn compress_chunked(source: &Path, prefix: &Path, chunk_size: u64) -> Result<ChunkManifest> {
    let done = compress(
        &[source],
        Sink::file(prefix),
        CompressOptions::new(Algorithm::Gzip).with_chunk_size(chunk_size),
    )
    .await?;
    match done.artifact {
        Artifact::Chunks { manifest, .. } => Ok(manifest),
        other => panic!("expected chunks, got {other:?}"),
    }
}

#[tokio::test]
async fn test_parts_concatenate_to_unchunked_stream() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();

    let single = out.path().join("single.tar.gz");
    compress(&[&data], Sink::file(&single), CompressOptions::new(Algorithm::Gzip)).await?;
    let whole = fs::read(&single).unwrap();

    for chunk_size in [1_000u64, 32 * 1024, 10 * 1024 * 1024] {
        let prefix = out.path().join(format!("parts-{chunk_size}"));
        let manifest = compress_chunked(&data, &prefix, chunk_size).await?;

        assert_eq!(concat_parts(&prefix, &manifest), whole, "chunk size {chunk_size}");
        assert_eq!(manifest.total_size, whole.len() as u64);
        let expected_parts = (whole.len() as u64).div_ceil(chunk_size);
        assert_eq!(manifest.total_chunks as u64, expected_parts);
        assert!(manifest.chunks.iter().rev().skip(1).all(|c| c.size == chunk_size && !c.is_last));
        assert!(manifest.chunks.last().unwrap().is_last);
        assert_eq!(manifest.algorithm, Some(Algorithm::Gzip));
    }
    Ok(())
}

#[tokio::test]
async fn test_chunked_roundtrip_with_verification() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();
    let prefix = out.path().join("backup");
    let manifest = compress_chunked(&data, &prefix, 16 * 1024).await?;
    assert!(manifest.total_chunks > 5);

    let verified = Arc::new(Mutex::new(Vec::new()));
    let sink = verified.clone();
    let options = DecompressOptions::new().with_progress(move |event: ProgressEvent| {
        let sink = sink.clone();
        async move {
            if let ProgressEvent::ChunkVerified { index, .. } = event {
                sink.lock().unwrap().push(index);
            }
            Ok::<(), s_tar::progress::NotifyError>(())
        }
    });

    let restore = tempdir().unwrap();
    let stats = decompress(Source::chunks(&prefix), restore.path(), options).await?;
    assert_eq!(stats.files, 3);
    assert_eq!(stats.chunks, manifest.total_chunks as u64);
    assert_eq!(
        fs::read(restore.path().join("data/deeper/c.bin")).unwrap(),
        noise(70_000, 2)
    );

    let order = verified.lock().unwrap().clone();
    assert_eq!(order, (0..manifest.total_chunks).collect::<Vec<_>>());

    let listed = list_contents(Source::chunks(&prefix)).await?;
    assert!(listed.iter().any(|e| e.name == "data/a.bin" && e.size == 150_000));
    Ok(())
}

#[tokio::test]
async fn test_large_input_chunk_count() -> Result<()> {
    let src = tempdir().unwrap();
    let big = src.path().join("big.bin");
    fs::write(&big, noise(4 * 1024 * 1024, 7)).unwrap();
    let out = tempdir().unwrap();
    let prefix = out.path().join("big");

    let chunk_size: u64 = 400 * 1024;
    let done = compress(
        &[&big],
        Sink::file(&prefix),
        CompressOptions::new(Algorithm::None)
            .with_chunk_size(chunk_size)
            .with_pipe(PipeConfig::single_slot(64 * 1024)),
    )
    .await?;
    let Artifact::Chunks { manifest, .. } = done.artifact else {
        panic!("expected chunks");
    };
    // one header block, the padded body and the two end blocks
    let tar_len: u64 = 512 + 4 * 1024 * 1024 + 1024;
    assert_eq!(manifest.total_size, tar_len);
    assert_eq!(manifest.total_chunks as u64, tar_len.div_ceil(chunk_size));
    assert_eq!(done.stats.chunks, manifest.total_chunks as u64);

    let restore = tempdir().unwrap();
    decompress(Source::chunks(&prefix), restore.path(), DecompressOptions::new()).await?;
    assert_eq!(fs::read(restore.path().join("big.bin")).unwrap(), fs::read(&big).unwrap());
    Ok(())
}

#[tokio::test]
async fn test_corrupt_byte_names_the_chunk() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();
    let prefix = out.path().join("flipped");
    let manifest = compress_chunked(&data, &prefix, 16 * 1024).await?;

    for index in [0u32, 3, manifest.total_chunks - 1] {
        let path = part_path(&prefix, index);
        let original = fs::read(&path).unwrap();
        let mut damaged = original.clone();
        let middle = damaged.len() / 2;
        damaged[middle] ^= 0x01;
        fs::write(&path, &damaged).unwrap();

        let restore = tempdir().unwrap();
        let err = decompress(Source::chunks(&prefix), restore.path(), DecompressOptions::new())
            .await
            .unwrap_err();
        match err {
            STarError::ChunkCorrupt { index: failed, .. } => assert_eq!(failed, index),
            other => panic!("expected ChunkCorrupt for part {index}, got {other:?}"),
        }

        // listing verifies the same way
        let listing = list_contents(Source::chunks(&prefix)).await;
        assert!(matches!(listing, Err(ref e) if e.is_integrity()));

        fs::write(&path, &original).unwrap();
    }
    Ok(())
}

#[tokio::test]
async fn test_truncated_part_is_corrupt() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();
    let prefix = out.path().join("short");
    compress_chunked(&data, &prefix, 16 * 1024).await?;

    let path = part_path(&prefix, 1);
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

    let restore = tempdir().unwrap();
    let err = decompress(Source::chunks(&prefix), restore.path(), DecompressOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, STarError::ChunkCorrupt { index: 1, .. }));
    Ok(())
}

#[tokio::test]
async fn test_corrupt_part_mid_entry_leaves_no_partial_file() -> Result<()> {
    let src = tempdir().unwrap();
    let data = src.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("big.bin"), noise(1024 * 1024, 7)).unwrap();
    let out = tempdir().unwrap();
    let prefix = out.path().join("big");

    let done = compress(
        &[data.join("big.bin")],
        Sink::file(&prefix),
        CompressOptions::new(Algorithm::None).with_chunk_size(128 * 1024),
    )
    .await?;
    let manifest = match done.artifact {
        Artifact::Chunks { manifest, .. } => manifest,
        other => panic!("expected chunks, got {other:?}"),
    };
    assert!(manifest.total_chunks >= 9);

    // the damaged part lies inside the file's body
    let index = manifest.total_chunks - 2;
    let path = part_path(&prefix, index);
    let mut bytes = fs::read(&path).unwrap();
    bytes[100] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let restore = tempdir().unwrap();
    let err = decompress(Source::chunks(&prefix), restore.path(), DecompressOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, STarError::ChunkCorrupt { index: failed, .. } if failed == index));
    assert!(!restore.path().join("big.bin").exists());
    Ok(())
}

#[tokio::test]
async fn test_parts_without_manifest_are_refused() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();
    let prefix = out.path().join("orphans");
    compress_chunked(&data, &prefix, 16 * 1024).await?;
    fs::remove_file(manifest_path(&prefix)).unwrap();
    assert!(part_path(&prefix, 0).exists());

    let restore = tempdir().unwrap();
    let err = decompress(Source::chunks(&prefix), restore.path(), DecompressOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, STarError::ManifestMissing { .. }));
    assert_eq!(err.exit_code(), s_tar::error::exit_code::INTEGRITY);
    assert_eq!(fs::read_dir(restore.path()).unwrap().count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_part_is_reported() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();
    let prefix = out.path().join("gap");
    compress_chunked(&data, &prefix, 16 * 1024).await?;
    fs::remove_file(part_path(&prefix, 2)).unwrap();

    let restore = tempdir().unwrap();
    let err = decompress(Source::chunks(&prefix), restore.path(), DecompressOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, STarError::ChunkMissing { index: 2, .. }));
    Ok(())
}

#[tokio::test]
async fn test_rerun_replaces_previous_manifest() -> Result<()> {
    let src = tempdir().unwrap();
    let data = make_data_dir(src.path());
    let out = tempdir().unwrap();
    let prefix = out.path().join("again");

    let first = compress_chunked(&data, &prefix, 8 * 1024).await?;
    let second = compress_chunked(&data, &prefix, 64 * 1024).await?;
    assert!(second.total_chunks < first.total_chunks);

    let on_disk: ChunkManifest =
        serde_json::from_slice(&fs::read(manifest_path(&prefix)).unwrap()).unwrap();
    assert_eq!(on_disk, second);
    Ok(())
}
