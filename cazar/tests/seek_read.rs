mod common;
use common::*;

use rand::Rng;

use cazar::{ReaderError, SeekableReader};

// The canonical random access scenario: a long repetitive stream chunked,
// archived, then read at an arbitrary offset.
#[tokio::test]
async fn random_access_read() {
    let dir = temp_dir();
    let store_root = dir.path().join("store");
    let archive_path = dir.path().join("out.catar.zst");
    let content: Vec<u8> = b"ABCDEFGHIJ".repeat(100_000);
    let chunks = split_chunks(&content, 64 * 1024);
    store_and_archive(&store_root, &archive_path, &chunks, 3).await;

    let file = tokio::fs::File::open(&archive_path).await.unwrap();
    let mut reader = SeekableReader::new(file, &()).await.unwrap();
    assert_eq!(reader.size(), content.len() as u64);

    let data = reader.read_at(123_456, 10).await.unwrap();
    assert_eq!(&data[..], &content[123_456..123_466]);
}

#[tokio::test]
async fn reads_equal_full_decompression() {
    let dir = temp_dir();
    let store_root = dir.path().join("store");
    let archive_path = dir.path().join("out.catar.zst");
    let mut content = Vec::new();
    for index in 0..40 {
        content.extend_from_slice(&chunk_content(index, 3000));
    }
    let chunks = split_chunks(&content, 7000);
    store_and_archive(&store_root, &archive_path, &chunks, 3).await;

    let file = tokio::fs::File::open(&archive_path).await.unwrap();
    let mut reader = SeekableReader::new(file, &()).await.unwrap();
    let size = reader.size();
    assert_eq!(size, content.len() as u64);

    // Whole-content read.
    let all = reader.read_at(0, size as usize).await.unwrap();
    assert_eq!(&all[..], &content[..]);

    // Arbitrary ranges, including frame-straddling ones.
    let mut rng = rand::rng();
    for _ in 0..50 {
        let pos = rng.random_range(0..size);
        let count = rng.random_range(0..(size - pos).min(20_000)) as usize;
        let data = reader.read_at(pos, count).await.unwrap();
        assert_eq!(&data[..], &content[pos as usize..pos as usize + count]);
    }
}

#[tokio::test]
async fn cursor_tracks_sequential_reads() {
    let dir = temp_dir();
    let store_root = dir.path().join("store");
    let archive_path = dir.path().join("out.catar.zst");
    let content: Vec<u8> = (0..100_000u32).flat_map(|v| v.to_le_bytes()).collect();
    let chunks = split_chunks(&content, 32 * 1024);
    store_and_archive(&store_root, &archive_path, &chunks, 3).await;

    let file = tokio::fs::File::open(&archive_path).await.unwrap();
    let mut reader = SeekableReader::new(file, &()).await.unwrap();

    reader.seek(1000);
    let first = reader.read(512).await.unwrap();
    assert_eq!(reader.position(), 1512);
    assert_eq!(&first[..], &content[1000..1512]);

    reader.skip(100);
    let second = reader.read(512).await.unwrap();
    assert_eq!(&second[..], &content[1612..2124]);

    // Clamped seek at the end produces empty reads.
    reader.seek(u64::MAX);
    assert_eq!(reader.position(), content.len() as u64);
    assert!(reader.read(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_dictionary_is_rejected_at_construction() {
    let dir = temp_dir();
    let archive_path = dir.path().join("dict.zst");
    // One frame compressed against a dictionary nothing can resolve.
    let samples: Vec<Vec<u8>> = (0..300).map(|index| chunk_content(index, 2000)).collect();
    let mut dictionary =
        zstd::dict::from_samples(&samples, 4096).expect("train a small dictionary");
    dictionary[4..8].copy_from_slice(&77u32.to_le_bytes());
    let mut compressor = zstd::bulk::Compressor::with_dictionary(3, &dictionary).unwrap();
    std::fs::write(&archive_path, compressor.compress(&samples[0]).unwrap()).unwrap();

    let file = tokio::fs::File::open(&archive_path).await.unwrap();
    match SeekableReader::new(file, &()).await {
        Err(ReaderError::MissingDictionary { dictionary_id: 77 }) => {}
        other => panic!("expected MissingDictionary(77), got {:?}", other.err()),
    }
}

#[tokio::test]
async fn dictionary_frames_resolve_through_resolver() {
    let dir = temp_dir();
    let archive_path = dir.path().join("dict.zst");
    let samples: Vec<Vec<u8>> = (0..300).map(|index| chunk_content(index, 2000)).collect();
    let mut dictionary =
        zstd::dict::from_samples(&samples, 4096).expect("train a small dictionary");
    dictionary[4..8].copy_from_slice(&9u32.to_le_bytes());

    let mut archive = Vec::new();
    let mut content = Vec::new();
    let mut compressor = zstd::bulk::Compressor::with_dictionary(3, &dictionary).unwrap();
    for sample in samples.iter().take(8) {
        archive.extend_from_slice(&compressor.compress(sample).unwrap());
        content.extend_from_slice(sample);
    }
    std::fs::write(&archive_path, &archive).unwrap();

    let mut resolver = std::collections::HashMap::new();
    resolver.insert(9u32, dictionary);
    let file = tokio::fs::File::open(&archive_path).await.unwrap();
    let mut reader = SeekableReader::new(file, &resolver).await.unwrap();
    let data = reader.read_at(2500, 3000).await.unwrap();
    assert_eq!(&data[..], &content[2500..5500]);
}
