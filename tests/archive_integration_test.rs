//! Archive export/import through the public API
//!
//! Covers the round trip for structural and segmentation layers, digest
//! tamper detection, missing entries, and sharded stores.

use std::io::{Cursor, Read};
use voxpack::{
    archive::MANIFEST_ENTRY,
    export_dataset_to_bytes, import_archive, ArchiveWriter, BufferedArchiveWriter, CancellationToken,
    ChannelInfo, ExportLayer, ExportRequest, ImportOptions, NormalizedVolume, TrackRow, TrackSet,
    ValueRange, VolumeDataType, VoxError, WriterOptions,
};
use zip::ZipArchive;

fn structural_volume() -> NormalizedVolume {
    NormalizedVolume::new(
        4,
        2,
        1,
        1,
        VolumeDataType::Uint8,
        ValueRange::new(0.0, 255.0),
        vec![0, 32, 64, 96, 128, 160, 192, 224],
        None,
    )
    .unwrap()
}

fn segmentation_volume(timepoint: u32) -> NormalizedVolume {
    let labels = vec![0, 1 + timepoint, 2 + timepoint, 0];
    let normalized: Vec<u8> = labels
        .iter()
        .flat_map(|&label| {
            if label == 0 {
                [0, 0, 0, 0]
            } else {
                [label as u8 * 40, 255 - label as u8 * 30, 17 * label as u8, 255]
            }
        })
        .collect();
    NormalizedVolume::new(
        2,
        2,
        1,
        4,
        VolumeDataType::Uint16,
        ValueRange::new(0.0, 3.0 + timepoint as f64),
        normalized,
        Some(labels),
    )
    .unwrap()
}

fn scenario_request() -> ExportRequest {
    ExportRequest::new(
        vec![ChannelInfo::new("ch0", "Membrane")],
        vec![
            ExportLayer::new("raw", "ch0", vec![structural_volume()]).with_label("Raw"),
            ExportLayer::new(
                "cells",
                "ch0",
                vec![segmentation_volume(0), segmentation_volume(1)],
            )
            .segmentation(),
        ],
    )
}

fn entry_names(bytes: &[u8]) -> Vec<String> {
    let zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
    zip.file_names().map(str::to_string).collect()
}

/// Copy an archive, passing every entry through `edit`
fn rewrite_archive(bytes: &[u8], edit: impl Fn(&str, Vec<u8>) -> Option<Vec<u8>>) -> Vec<u8> {
    let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut writer = BufferedArchiveWriter::new();
    for index in 0..zip.len() {
        let mut file = zip.by_index(index).unwrap();
        let name = file.name().to_string();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        if let Some(data) = edit(&name, data) {
            writer.add_entry(&name, &data).unwrap();
        }
    }
    writer.into_bytes().unwrap()
}

#[tokio::test]
async fn test_concrete_scenario_round_trip() {
    let (manifest, bytes) =
        export_dataset_to_bytes(scenario_request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    assert_eq!(manifest.dataset.total_volume_count, 3);

    let names = entry_names(&bytes);
    for expected in [
        "manifest.json",
        "zarr/.zgroup",
        "zarr/.zattrs",
        "zarr/raw/scale0/data/.zarray",
        "zarr/raw/scale0/data/0/0/0/0/0",
        "zarr/raw/scale2/data/0/0/0/0/0",
        "zarr/cells/scale0/data/1/0/0/0/0",
        "zarr/cells/scale0/labels/.zarray",
        "zarr/cells/scale0/labels/0/0/0/0",
        "zarr/cells/scale0/labels/1/0/0/0",
        "zarr/cells/scale1/histogram/1/0",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {}", expected);
    }
    assert_eq!(names.last().map(String::as_str), Some(MANIFEST_ENTRY));

    let imported = import_archive(bytes, &ImportOptions::new()).await.unwrap();
    assert_eq!(imported.volume_count(), 3);
    let raw = imported.layer("raw").unwrap();
    assert_eq!(raw.manifest.label, "Raw");
    assert_eq!(raw.volumes[0].normalized, vec![0, 32, 64, 96, 128, 160, 192, 224]);

    let cells = imported.layer("cells").unwrap();
    assert!(cells.manifest.is_segmentation);
    for (timepoint, volume) in cells.volumes.iter().enumerate() {
        let original = segmentation_volume(timepoint as u32);
        assert_eq!(volume.normalized, original.normalized);
        assert_eq!(volume.segmentation_labels, original.segmentation_labels);
    }
}

#[tokio::test]
async fn test_digests_survive_round_trip() {
    let (manifest, bytes) =
        export_dataset_to_bytes(scenario_request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    let imported = import_archive(bytes, &ImportOptions::new()).await.unwrap();
    for layer in manifest.layers() {
        let reimported = imported.manifest().find_layer(&layer.key).unwrap();
        assert_eq!(reimported.volumes, layer.volumes);
        for entry in &layer.volumes {
            assert_eq!(entry.sha256.len(), 64);
            assert_eq!(entry.labels_sha256.is_some(), layer.is_segmentation);
        }
    }
}

#[tokio::test]
async fn test_tampered_digest_is_rejected() {
    let (_, bytes) =
        export_dataset_to_bytes(scenario_request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    let tampered = rewrite_archive(&bytes, |name, data| {
        if name != MANIFEST_ENTRY {
            return Some(data);
        }
        let mut manifest: serde_json::Value = serde_json::from_slice(&data).unwrap();
        let digest = &mut manifest["dataset"]["channels"][0]["layers"][0]["volumes"][0]["sha256"];
        let original = digest.as_str().unwrap().to_string();
        let flipped = if original.starts_with('0') { "1" } else { "0" };
        *digest = serde_json::Value::String(format!("{}{}", flipped, &original[1..]));
        Some(serde_json::to_vec(&manifest).unwrap())
    });

    let err = import_archive(tampered, &ImportOptions::new()).await.unwrap_err();
    assert!(matches!(err, VoxError::DigestMismatch { .. }), "got {:?}", err);
    assert_eq!(err.category(), voxpack::ErrorCategory::Integrity);
}

#[tokio::test]
async fn test_missing_chunk_is_rejected() {
    let (_, bytes) =
        export_dataset_to_bytes(scenario_request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    let truncated = rewrite_archive(&bytes, |name, data| {
        (name != "zarr/cells/scale0/labels/1/0/0/0").then_some(data)
    });
    let err = import_archive(truncated, &ImportOptions::new()).await.unwrap_err();
    assert!(matches!(err, VoxError::MissingEntry(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_missing_mip_chunk_is_rejected() {
    let (_, bytes) =
        export_dataset_to_bytes(scenario_request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    let truncated = rewrite_archive(&bytes, |name, data| {
        (name != "zarr/raw/scale1/data/0/0/0/0/0").then_some(data)
    });
    let err = import_archive(truncated, &ImportOptions::new()).await.unwrap_err();
    assert!(matches!(err, VoxError::MissingEntry(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unknown_format_is_rejected() {
    let (_, bytes) =
        export_dataset_to_bytes(scenario_request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
    let relabeled = rewrite_archive(&bytes, |name, data| {
        if name != MANIFEST_ENTRY {
            return Some(data);
        }
        let mut manifest: serde_json::Value = serde_json::from_slice(&data).unwrap();
        manifest["format"] = serde_json::Value::String("voxpack-preprocessed-v9".to_string());
        Some(serde_json::to_vec(&manifest).unwrap())
    });
    let err = import_archive(relabeled, &ImportOptions::new()).await.unwrap_err();
    assert!(matches!(err, VoxError::UnsupportedFormat(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_sharded_round_trip_with_tracks() {
    let volumes: Vec<NormalizedVolume> = (0..2)
        .map(|t| {
            NormalizedVolume::new(
                8,
                8,
                4,
                1,
                VolumeDataType::Float32,
                ValueRange::new(-1.0, 1.0),
                (0..256).map(|i| ((i * 7 + t * 13) % 256) as u8).collect(),
                None,
            )
            .unwrap()
        })
        .collect();
    let tracks = TrackSet::new(
        "lineage",
        "Lineage",
        vec![
            TrackRow([1.0, 0.0, 1.5, 2.0, 0.25, 1.0, 0.0, -1.0]),
            TrackRow([1.0, 1.0, 1.75, 2.125, 0.5, 1.0, 0.0, -1.0]),
        ],
    )
    .with_channel("ch0");
    let request = ExportRequest::new(
        vec![ChannelInfo::new("ch0", "Nuclei")],
        vec![ExportLayer::new("raw", "ch0", volumes.clone())],
    )
    .with_track_sets(vec![tracks.clone()]);
    // 2x2x2 chunks of 8 bytes; a 64 byte target groups several per shard
    let options = WriterOptions::default()
        .with_chunk_shape([2, 2, 2])
        .with_target_shard_bytes(Some(64));

    let (manifest, bytes) = export_dataset_to_bytes(request, &options, &CancellationToken::new())
        .await
        .unwrap();
    let data = &manifest.find_layer("raw").unwrap().level0().unwrap().zarr.data;
    assert!(data.is_sharded());
    assert!(entry_names(&bytes).iter().any(|n| n.starts_with("zarr/raw/scale0/data/shards/")));
    assert!(entry_names(&bytes).iter().any(|n| n == "tracks/lineage.csv"));

    let imported = import_archive(bytes, &ImportOptions::new()).await.unwrap();
    let raw = imported.layer("raw").unwrap();
    assert_eq!(raw.volumes, volumes);
    assert_eq!(imported.track_sets, vec![tracks]);
}
