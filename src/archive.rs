//! Archive import/export
//!
//! An archive is a zip container holding the chunked store under its root
//! prefix (default `zarr/`), the track set CSVs under `tracks/`, and a
//! `manifest.json` copy of the root manifest written last.
//!
//! Export goes through an [`ArchiveWriter`], either buffered in memory or
//! written incrementally to a caller-supplied sink. Import locates the
//! manifest first, re-validates it, then decodes every level-0 volume and
//! checks it against the recorded SHA-256 digest before any data is handed
//! back.

use crate::cancel::CancellationToken;
use crate::config::WriterOptions;
use crate::error::{Result, VoxError};
use crate::io::{MemoryStore, StorageBackend, Store};
use crate::manifest::{
    LayerManifest, PreprocessedManifest, VoxelResolution, LEGACY_MANIFEST_FORMATS, MANIFEST_FORMAT,
};
use crate::progress::{emit, ImportMilestone, ImportProgress, ProgressCallback};
use crate::store::{volume_name, zattrs_key, zgroup_key, ChannelInfo, DatasetInfo, DatasetReader, DatasetWriter, LayerPlan};
use crate::tracks::TrackSet;
use crate::types::{MovieMode, ValueRange};
use crate::utils::format_bytes;
use crate::validate::coerce_manifest;
use crate::volume::NormalizedVolume;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod as ZipMethod, ZipArchive, ZipWriter};

/// Archive entry holding the standalone manifest
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Sink for archive entries
pub trait ArchiveWriter: Send {
    /// Append one entry; entries are written in call order.
    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Entries appended so far
    fn entry_count(&self) -> usize;

    /// Write the central directory. No entries may follow.
    fn finish(&mut self) -> Result<()>;
}

fn entry_options() -> SimpleFileOptions {
    // Chunks are already compressed
    SimpleFileOptions::default()
        .compression_method(ZipMethod::Stored)
        .large_file(true)
}

struct ZipSink<W: Write + Seek> {
    zip: Option<ZipWriter<W>>,
    output: Option<W>,
    entries: usize,
}

impl<W: Write + Seek> ZipSink<W> {
    fn new(inner: W) -> Self {
        Self {
            zip: Some(ZipWriter::new(inner)),
            output: None,
            entries: 0,
        }
    }

    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let zip = self
            .zip
            .as_mut()
            .ok_or_else(|| VoxError::Archive(format!("archive already finished, cannot add {}", name)))?;
        zip.start_file(name, entry_options())?;
        zip.write_all(data)?;
        self.entries += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(zip) = self.zip.take() {
            self.output = Some(zip.finish()?);
        }
        Ok(())
    }
}

/// Builds the whole archive in memory
pub struct BufferedArchiveWriter {
    sink: ZipSink<Cursor<Vec<u8>>>,
}

impl BufferedArchiveWriter {
    pub fn new() -> Self {
        Self {
            sink: ZipSink::new(Cursor::new(Vec::new())),
        }
    }

    /// The finished archive
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        self.sink.finish()?;
        self.sink
            .output
            .map(Cursor::into_inner)
            .ok_or_else(|| VoxError::Archive("archive was not finished".to_string()))
    }
}

impl Default for BufferedArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveWriter for BufferedArchiveWriter {
    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.sink.add_entry(name, data)
    }

    fn entry_count(&self) -> usize {
        self.sink.entries
    }

    fn finish(&mut self) -> Result<()> {
        self.sink.finish()
    }
}

/// Forward-only view of a sink as `Write + Seek`.
///
/// The zip writer seeks back only to rewrite the header of the entry it is
/// writing, so bytes from that entry on stay buffered. Everything before it
/// is committed to the sink and can no longer be sought to.
struct Spool<W> {
    state: Arc<Mutex<SpoolState<W>>>,
}

struct SpoolState<W> {
    sink: W,
    committed: u64,
    buffer: Vec<u8>,
    position: u64,
}

impl<W> Clone for Spool<W> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<W: Write> Spool<W> {
    fn new(sink: W) -> Self {
        Self {
            state: Arc::new(Mutex::new(SpoolState {
                sink,
                committed: 0,
                buffer: Vec::new(),
                position: 0,
            })),
        }
    }

    fn len(&self) -> u64 {
        let state = self.state.lock();
        state.committed + state.buffer.len() as u64
    }

    /// Buffered bytes not yet handed to the sink
    fn pending(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Hand every byte before `offset` to the sink.
    fn commit(&self, offset: u64) -> std::io::Result<()> {
        let mut state = self.state.lock();
        let upto = offset.min(state.committed + state.buffer.len() as u64);
        if upto <= state.committed {
            return Ok(());
        }
        let count = (upto - state.committed) as usize;
        let SpoolState { sink, buffer, .. } = &mut *state;
        sink.write_all(&buffer[..count])?;
        sink.flush()?;
        buffer.drain(..count);
        state.committed = upto;
        Ok(())
    }

    fn into_sink(self) -> Result<W> {
        Arc::try_unwrap(self.state)
            .map(|state| state.into_inner().sink)
            .map_err(|_| VoxError::Archive("archive sink is still in use".to_string()))
    }
}

impl<W: Write> Write for Spool<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock();
        let start = (state.position - state.committed) as usize;
        let end = start + data.len();
        if end > state.buffer.len() {
            state.buffer.resize(end, 0);
        }
        state.buffer[start..end].copy_from_slice(data);
        state.position += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<W: Write> Seek for Spool<W> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let mut state = self.state.lock();
        let len = state.committed + state.buffer.len() as u64;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => state.position.checked_add_signed(delta),
        };
        match target {
            Some(target) if target >= state.committed => {
                state.position = target;
                Ok(target)
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("cannot seek before committed offset {}", state.committed),
            )),
        }
    }
}

/// Writes entries through to a forward-only `sink`.
///
/// Each entry reaches the sink once the next one starts, or on
/// [`ArchiveWriter::finish`]; at most one entry is held in memory.
pub struct StreamingArchiveWriter<W: Write + Send> {
    spool: Spool<W>,
    sink: ZipSink<Spool<W>>,
}

impl<W: Write + Send> StreamingArchiveWriter<W> {
    pub fn new(sink: W) -> Self {
        let spool = Spool::new(sink);
        Self {
            sink: ZipSink::new(spool.clone()),
            spool,
        }
    }

    /// Bytes written but not yet handed to the sink
    pub fn pending_bytes(&self) -> usize {
        self.spool.pending()
    }

    /// Recover the sink after [`ArchiveWriter::finish`]
    pub fn into_inner(mut self) -> Result<W> {
        ArchiveWriter::finish(&mut self)?;
        let Self { spool, sink } = self;
        drop(sink);
        spool.into_sink()
    }
}

impl<W: Write + Send> ArchiveWriter for StreamingArchiveWriter<W> {
    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        // Starting this entry finalizes the previous one
        let boundary = self.spool.len();
        self.sink.add_entry(name, data)?;
        self.spool.commit(boundary)?;
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.sink.entries
    }

    fn finish(&mut self) -> Result<()> {
        self.sink.finish()?;
        self.spool.commit(self.spool.len())?;
        Ok(())
    }
}

/// Write-only [`Store`] that turns every write into an archive entry.
///
/// Keys in `required` are tracked so the caller can check that every root
/// entry reached the archive.
pub struct ArchiveStore<W: ArchiveWriter> {
    writer: Mutex<W>,
    required: BTreeSet<String>,
    persisted: Mutex<BTreeSet<String>>,
}

impl<W: ArchiveWriter> ArchiveStore<W> {
    pub fn new(writer: W, required: impl IntoIterator<Item = String>) -> Self {
        Self {
            writer: Mutex::new(writer),
            required: required.into_iter().collect(),
            persisted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Root entries expected for a store rooted at `root`
    pub fn required_root_entries(root: &str) -> Vec<String> {
        vec![zgroup_key(root), zattrs_key(root), MANIFEST_ENTRY.to_string()]
    }

    /// Required entries that were never written
    pub fn missing_entries(&self) -> Vec<String> {
        let persisted = self.persisted.lock();
        self.required
            .iter()
            .filter(|key| !persisted.contains(*key))
            .cloned()
            .collect()
    }

    /// Fail with [`VoxError::ExportIncomplete`] unless the persisted root
    /// entries match the required set exactly.
    pub fn ensure_complete(&self) -> Result<()> {
        let missing = self.missing_entries();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(VoxError::ExportIncomplete { missing })
        }
    }

    pub fn entry_count(&self) -> usize {
        self.writer.lock().entry_count()
    }

    /// Finish the archive and return the writer.
    pub fn into_writer(self) -> Result<W> {
        self.ensure_complete()?;
        let mut writer = self.writer.into_inner();
        writer.finish()?;
        Ok(writer)
    }
}

#[async_trait]
impl<W: ArchiveWriter> Store for ArchiveStore<W> {
    async fn read(&self, key: &str) -> Result<Bytes> {
        Err(VoxError::StorageBackend(format!(
            "archive store is write-only, cannot read {}",
            key
        )))
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        crate::io::validate_key(key)?;
        self.writer.lock().add_entry(key, data)?;
        if self.required.contains(key) {
            self.persisted.lock().insert(key.to_string());
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.persisted.lock().contains(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Err(VoxError::StorageBackend(format!(
            "archive store is append-only, cannot delete {}",
            key
        )))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn size(&self, key: &str) -> Result<usize> {
        Err(VoxError::NotFound(key.to_string()))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Archive
    }
}

/// One layer's already-normalized volumes, in timepoint order
#[derive(Debug, Clone)]
pub struct ExportLayer {
    pub key: String,
    pub label: String,
    pub channel_id: String,
    pub is_segmentation: bool,
    /// Defaults to the first volume's range
    pub normalization: Option<ValueRange>,
    pub volumes: Vec<NormalizedVolume>,
}

impl ExportLayer {
    pub fn new(key: impl Into<String>, channel_id: impl Into<String>, volumes: Vec<NormalizedVolume>) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            channel_id: channel_id.into(),
            is_segmentation: false,
            normalization: None,
            volumes,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_normalization(mut self, range: ValueRange) -> Self {
        self.normalization = Some(range);
        self
    }

    pub fn segmentation(mut self) -> Self {
        self.is_segmentation = true;
        self
    }

    fn plan(&self) -> Result<LayerPlan> {
        let first = self.volumes.first().ok_or_else(|| {
            VoxError::Configuration(format!("layer '{}' has no volumes to export", self.key))
        })?;
        let normalization = if self.is_segmentation {
            None
        } else {
            Some(self.normalization.unwrap_or_else(|| first.range()))
        };
        Ok(LayerPlan {
            key: self.key.clone(),
            label: self.label.clone(),
            channel_id: self.channel_id.clone(),
            is_segmentation: self.is_segmentation,
            volume_count: self.volumes.len(),
            dims: first.dims(),
            channels: first.channels,
            data_type: first.data_type,
            normalization,
        })
    }
}

/// Everything that goes into one archive
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub movie_mode: MovieMode,
    pub channels: Vec<ChannelInfo>,
    pub layers: Vec<ExportLayer>,
    pub track_sets: Vec<TrackSet>,
    pub voxel_resolution: Option<VoxelResolution>,
}

impl ExportRequest {
    pub fn new(channels: Vec<ChannelInfo>, layers: Vec<ExportLayer>) -> Self {
        Self {
            movie_mode: MovieMode::ThreeD,
            channels,
            layers,
            track_sets: Vec::new(),
            voxel_resolution: None,
        }
    }

    pub fn with_movie_mode(mut self, mode: MovieMode) -> Self {
        self.movie_mode = mode;
        self
    }

    pub fn with_track_sets(mut self, track_sets: Vec<TrackSet>) -> Self {
        self.track_sets = track_sets;
        self
    }

    pub fn with_voxel_resolution(mut self, resolution: VoxelResolution) -> Self {
        self.voxel_resolution = Some(resolution);
        self
    }
}

/// A sealed archive and the manifest written into it
#[derive(Debug)]
pub struct ExportedArchive<W> {
    pub manifest: PreprocessedManifest,
    pub writer: W,
    pub entry_count: usize,
}

/// Export already-normalized layers into `writer`.
pub async fn export_dataset<W: ArchiveWriter + 'static>(
    request: ExportRequest,
    options: &WriterOptions,
    writer: W,
    cancel: &CancellationToken,
) -> Result<ExportedArchive<W>> {
    cancel.check()?;
    let store = Arc::new(ArchiveStore::new(
        writer,
        ArchiveStore::<W>::required_root_entries(&options.root_prefix),
    ));

    let mut dataset = DatasetWriter::create(store.clone(), options.clone()).await?;
    for layer in &request.layers {
        dataset.add_layer(layer.plan()?).await?;
    }
    for layer in &request.layers {
        for (timepoint, volume) in layer.volumes.iter().enumerate() {
            cancel.check()?;
            dataset.write_timepoint(&layer.key, timepoint, volume).await?;
        }
    }
    for track_set in &request.track_sets {
        cancel.check()?;
        store.write(&track_set.path(), track_set.to_csv()?.as_bytes()).await?;
    }

    cancel.check()?;
    let info = DatasetInfo::new(request.movie_mode, request.channels)
        .with_track_sets(request.track_sets.iter().map(TrackSet::manifest_entry).collect())
        .with_voxel_resolution(request.voxel_resolution);
    let manifest = dataset.finish(info).await?;
    store.write(MANIFEST_ENTRY, &manifest.to_json_pretty()?).await?;

    let store = Arc::try_unwrap(store)
        .map_err(|_| VoxError::Archive("archive store is still shared".to_string()))?;
    let entry_count = store.entry_count();
    let writer = store.into_writer()?;
    info!(
        entries = entry_count,
        total_volume_count = manifest.dataset.total_volume_count,
        "exported archive"
    );
    Ok(ExportedArchive {
        manifest,
        writer,
        entry_count,
    })
}

/// Export into an in-memory zip and return its bytes.
pub async fn export_dataset_to_bytes(
    request: ExportRequest,
    options: &WriterOptions,
    cancel: &CancellationToken,
) -> Result<(PreprocessedManifest, Vec<u8>)> {
    let exported = export_dataset(request, options, BufferedArchiveWriter::new(), cancel).await?;
    Ok((exported.manifest, exported.writer.into_bytes()?))
}

/// Package an existing chunked store into an archive.
///
/// The root manifest is re-validated and every array of every scale is
/// checked for missing or incomplete chunks before anything is copied.
pub async fn pack_store<S, W>(store: Arc<S>, root: &str, writer: W) -> Result<ExportedArchive<W>>
where
    S: Store + ?Sized,
    W: ArchiveWriter + 'static,
{
    let reader = DatasetReader::open(store.clone(), root).await?;
    for layer in reader.manifest().layers() {
        for scale in &layer.zarr.scales {
            reader.verify_scale(&layer.key, scale.level).await?;
        }
    }

    let mut keys = store.list(&format!("{}/", root)).await?;
    keys.sort();
    let archive = ArchiveStore::new(writer, ArchiveStore::<W>::required_root_entries(root));
    for key in &keys {
        archive.write(key, &store.read(key).await?).await?;
    }
    for track_set in &reader.manifest().dataset.track_sets {
        archive.write(&track_set.path, &store.read(&track_set.path).await?).await?;
    }
    let manifest = reader.into_manifest();
    archive.write(MANIFEST_ENTRY, &manifest.to_json_pretty()?).await?;

    let entry_count = archive.entry_count();
    let writer = archive.into_writer()?;
    info!(root, entries = entry_count, "packed store");
    Ok(ExportedArchive {
        manifest,
        writer,
        entry_count,
    })
}

/// Import settings
#[derive(Clone, Default)]
pub struct ImportOptions {
    pub progress: Option<ProgressCallback<ImportProgress>>,
    pub cancel: CancellationToken,
}

impl ImportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: ProgressCallback<ImportProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A layer with every level-0 timepoint decoded and verified
#[derive(Debug, Clone)]
pub struct ImportedLayer {
    pub manifest: LayerManifest,
    /// Ordered by timepoint
    pub volumes: Vec<NormalizedVolume>,
}

/// A verified dataset read back from an archive
pub struct ImportedDataset {
    pub reader: DatasetReader<MemoryStore>,
    pub layers: Vec<ImportedLayer>,
    pub track_sets: Vec<TrackSet>,
}

impl std::fmt::Debug for ImportedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportedDataset")
            .field("manifest", self.manifest())
            .field("layers", &self.layers)
            .field("track_sets", &self.track_sets)
            .finish_non_exhaustive()
    }
}

impl ImportedDataset {
    pub fn manifest(&self) -> &PreprocessedManifest {
        self.reader.manifest()
    }

    pub fn layer(&self, key: &str) -> Option<&ImportedLayer> {
        self.layers.iter().find(|layer| layer.manifest.key == key)
    }

    /// Number of decoded volumes across all layers
    pub fn volume_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.volumes.len()).sum()
    }
}

fn check_format(value: &Value) -> Result<()> {
    match value.get("format").and_then(Value::as_str) {
        Some(MANIFEST_FORMAT) => Ok(()),
        Some(format) if LEGACY_MANIFEST_FORMATS.contains(&format) => Err(VoxError::UnsupportedFormat(
            format!("unsupported legacy format '{}'", format),
        )),
        Some(format) => Err(VoxError::UnsupportedFormat(format!(
            "unknown manifest format '{}', expected '{}'",
            format, MANIFEST_FORMAT
        ))),
        None => Err(VoxError::UnsupportedFormat(
            "manifest carries no format tag".to_string(),
        )),
    }
}

fn read_entry<R: Read + Seek>(zip: &mut ZipArchive<R>, index: usize) -> Result<Option<(String, Bytes)>> {
    let mut file = zip.by_index(index)?;
    if file.is_dir() {
        return Ok(None);
    }
    let name = file.name().to_string();
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(Some((name, Bytes::from(data))))
}

/// Import and verify an archive held in memory.
pub async fn import_archive(bytes: impl Into<Bytes>, options: &ImportOptions) -> Result<ImportedDataset> {
    let result = import_verified(bytes.into(), options).await;
    match &result {
        Err(e) if e.is_aborted() => info!("archive import cancelled"),
        Err(e) => warn!(error = %e, "archive import failed"),
        Ok(_) => {}
    }
    result
}

async fn import_verified(bytes: Bytes, options: &ImportOptions) -> Result<ImportedDataset> {
    let cancel = &options.cancel;
    let progress = &options.progress;
    cancel.check()?;
    let archive_bytes = bytes.len() as u64;
    emit(
        progress,
        ImportProgress::Bytes {
            processed: archive_bytes,
            total: Some(archive_bytes),
        },
    );
    emit(progress, ImportProgress::Milestone(ImportMilestone::Scan));

    let mut zip = ZipArchive::new(Cursor::new(bytes))?;

    let manifest_value: Value = {
        let mut file = match zip.by_name(MANIFEST_ENTRY) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Err(VoxError::MissingEntry(MANIFEST_ENTRY.to_string())),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        serde_json::from_slice(&data)?
    };
    check_format(&manifest_value)?;
    let manifest = coerce_manifest(&manifest_value)?;

    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        cancel.check()?;
        if let Some(entry) = read_entry(&mut zip, index)? {
            entries.push(entry);
        }
    }
    info!(
        entries = entries.len(),
        size = %format_bytes(archive_bytes),
        "scanned archive"
    );

    let reader = DatasetReader::new(Arc::new(MemoryStore::from_entries(entries)), manifest);
    let total = reader.manifest().dataset.total_volume_count;

    emit(progress, ImportProgress::Milestone(ImportMilestone::Level0));
    let mut decoded = 0u64;
    let mut layers = Vec::new();
    for layer in reader.manifest().layers() {
        let mut entries: Vec<_> = layer.volumes.iter().collect();
        entries.sort_by_key(|entry| entry.timepoint);
        let mut volumes = Vec::with_capacity(entries.len());
        for entry in entries {
            cancel.check()?;
            let name = volume_name(&layer.key, entry.timepoint);
            let volume = reader.read_timepoint(&layer.key, 0, entry.timepoint).await?;
            crate::store::verify_volume_entry(&name, entry, &volume)?;
            debug!(volume = %name, "verified volume digest");
            decoded += 1;
            emit(progress, ImportProgress::Volumes { decoded, total });
            volumes.push(volume);
        }
        layers.push(ImportedLayer {
            manifest: layer.clone(),
            volumes,
        });
    }
    if decoded != total {
        return Err(VoxError::VolumeCountMismatch {
            declared: total,
            materialized: decoded,
        });
    }

    emit(progress, ImportProgress::Milestone(ImportMilestone::Mips));
    for layer in reader.manifest().layers() {
        for scale in layer.zarr.scales.iter().filter(|scale| scale.level > 0) {
            cancel.check()?;
            reader.verify_scale(&layer.key, scale.level).await?;
        }
    }

    emit(progress, ImportProgress::Milestone(ImportMilestone::Finalize));
    let mut track_sets = Vec::with_capacity(reader.manifest().dataset.track_sets.len());
    for entry in &reader.manifest().dataset.track_sets {
        let bytes = reader
            .store()
            .read_optional(&entry.path)
            .await?
            .ok_or_else(|| VoxError::MissingEntry(entry.path.clone()))?;
        let csv = std::str::from_utf8(&bytes)
            .map_err(|e| VoxError::Corrupt(format!("{}: {}", entry.path, e)))?;
        track_sets.push(TrackSet::from_manifest(entry, csv)?);
    }

    info!(volumes = decoded, track_sets = track_sets.len(), "imported archive");
    Ok(ImportedDataset {
        reader,
        layers,
        track_sets,
    })
}

/// Import an archive delivered as a stream of byte chunks.
///
/// Byte progress is reported per chunk. On cancellation the stream is
/// dropped without being polled again.
pub async fn import_archive_stream<S>(
    mut stream: S,
    total_bytes: Option<u64>,
    options: &ImportOptions,
) -> Result<ImportedDataset>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut buffer = Vec::with_capacity(total_bytes.unwrap_or(0) as usize);
    while let Some(chunk) = stream.next().await {
        if options.cancel.is_cancelled() {
            drop(stream);
            info!(received = buffer.len(), "archive stream cancelled");
            return Err(VoxError::Aborted);
        }
        buffer.extend_from_slice(&chunk?);
        emit(
            &options.progress,
            ImportProgress::Bytes {
                processed: buffer.len() as u64,
                total: total_bytes,
            },
        );
    }
    import_archive(buffer, options).await
}

/// Read and validate only the manifest of an archive.
pub fn read_archive_manifest(bytes: &[u8]) -> Result<PreprocessedManifest> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))?;
    let mut file = match zip.by_name(MANIFEST_ENTRY) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Err(VoxError::MissingEntry(MANIFEST_ENTRY.to_string())),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let value: Value = serde_json::from_slice(&data)?;
    check_format(&value)?;
    Ok(coerce_manifest(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeDataType;

    fn gradient() -> NormalizedVolume {
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

    fn request() -> ExportRequest {
        ExportRequest::new(
            vec![ChannelInfo::new("ch0", "Membrane")],
            vec![ExportLayer::new("raw", "ch0", vec![gradient()])],
        )
    }

    #[test]
    fn test_buffered_writer_produces_zip() {
        let mut writer = BufferedArchiveWriter::new();
        writer.add_entry("a.txt", b"hello").unwrap();
        writer.add_entry("dir/b.bin", &[1, 2, 3]).unwrap();
        assert_eq!(writer.entry_count(), 2);
        let bytes = writer.into_bytes().unwrap();

        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 2);
        let mut text = String::new();
        zip.by_name("a.txt").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_finished_writer_rejects_entries() {
        let mut writer = BufferedArchiveWriter::new();
        writer.finish().unwrap();
        assert!(matches!(writer.add_entry("late", b"x"), Err(VoxError::Archive(_))));
    }

    #[tokio::test]
    async fn test_archive_store_tracks_root_entries() {
        let store = ArchiveStore::new(
            BufferedArchiveWriter::new(),
            ArchiveStore::<BufferedArchiveWriter>::required_root_entries("zarr"),
        );
        store.write("zarr/.zgroup", b"{}").await.unwrap();
        store.write("zarr/raw/scale0/data/0/0/0/0/0", b"chunk").await.unwrap();
        assert_eq!(store.missing_entries(), vec!["manifest.json".to_string(), "zarr/.zattrs".to_string()]);
        assert!(store.read("zarr/.zgroup").await.is_err());
        match store.into_writer() {
            Err(VoxError::ExportIncomplete { missing }) => assert_eq!(missing.len(), 2),
            other => panic!("expected incomplete export, got {:?}", other.map(|w| w.entry_count())),
        }
    }

    #[tokio::test]
    async fn test_export_streams_into_sink() {
        let cancel = CancellationToken::new();
        let sink = Cursor::new(Vec::new());
        let exported = export_dataset(request(), &WriterOptions::default(), StreamingArchiveWriter::new(sink), &cancel)
            .await
            .unwrap();
        assert_eq!(exported.manifest.dataset.total_volume_count, 1);
        let bytes = exported.writer.into_inner().unwrap().into_inner();
        let manifest = read_archive_manifest(&bytes).unwrap();
        assert_eq!(manifest, exported.manifest);
    }

    /// Forward-only sink shared with the test, like a pipe or socket
    #[derive(Clone, Default)]
    struct Pipe {
        received: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for Pipe {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.received.lock().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_streaming_writer_needs_no_seek() {
        let pipe = Pipe::default();
        let mut writer = StreamingArchiveWriter::new(pipe.clone());
        writer.add_entry("a.bin", &[7; 100]).unwrap();
        assert!(pipe.received.lock().is_empty());

        // Starting the next entry releases the first one
        writer.add_entry("b.bin", &[9; 50]).unwrap();
        let flushed = pipe.received.lock().len();
        assert!(flushed > 100);
        assert!(writer.pending_bytes() >= 50);

        writer.into_inner().unwrap();
        let bytes = pipe.received.lock().clone();
        assert!(bytes.len() > flushed);
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut data = Vec::new();
        zip.by_name("a.bin").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![7; 100]);
        data.clear();
        zip.by_name("b.bin").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![9; 50]);
    }

    #[test]
    fn test_spool_refuses_seek_into_committed_bytes() {
        let mut spool = Spool::new(Pipe::default());
        spool.write_all(b"header-data").unwrap();
        spool.commit(6).unwrap();
        assert_eq!(spool.seek(SeekFrom::Start(6)).unwrap(), 6);
        assert!(spool.seek(SeekFrom::Start(2)).is_err());
        assert!(spool.seek(SeekFrom::End(-20)).is_err());
        assert_eq!(spool.seek(SeekFrom::End(0)).unwrap(), 11);
    }

    #[tokio::test]
    async fn test_export_into_forward_only_sink_imports() {
        let pipe = Pipe::default();
        let exported = export_dataset(
            request(),
            &WriterOptions::default(),
            StreamingArchiveWriter::new(pipe.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        exported.writer.into_inner().unwrap();
        let bytes = pipe.received.lock().clone();
        let imported = import_archive(bytes, &ImportOptions::new()).await.unwrap();
        assert_eq!(imported.manifest(), &exported.manifest);
        assert_eq!(imported.layer("raw").unwrap().volumes[0], gradient());
    }

    #[tokio::test]
    async fn test_export_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = export_dataset_to_bytes(request(), &WriterOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_import_rejects_missing_manifest_and_legacy_format() {
        let mut writer = BufferedArchiveWriter::new();
        writer.add_entry("zarr/.zgroup", b"{\"zarr_format\":2}").unwrap();
        let err = import_archive(writer.into_bytes().unwrap(), &ImportOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VoxError::MissingEntry(ref e) if e == MANIFEST_ENTRY));

        let mut writer = BufferedArchiveWriter::new();
        writer
            .add_entry(MANIFEST_ENTRY, br#"{"format": "voxpack-preprocessed-v2", "volumes": []}"#)
            .unwrap();
        let err = import_archive(writer.into_bytes().unwrap(), &ImportOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VoxError::UnsupportedFormat(ref m) if m.contains("legacy")));
    }

    #[tokio::test]
    async fn test_import_reports_milestones_in_order() {
        let (_, bytes) = export_dataset_to_bytes(request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let options = ImportOptions::new().with_progress(Arc::new(move |event: &ImportProgress| {
            sink.lock().push(event.clone())
        }));
        let imported = import_archive(bytes, &options).await.unwrap();
        assert_eq!(imported.volume_count(), 1);
        assert_eq!(imported.layer("raw").unwrap().volumes[0], gradient());

        let milestones: Vec<_> = events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ImportProgress::Milestone(m) => Some(*m),
                _ => None,
            })
            .collect();
        assert_eq!(
            milestones,
            vec![
                ImportMilestone::Scan,
                ImportMilestone::Level0,
                ImportMilestone::Mips,
                ImportMilestone::Finalize
            ]
        );
        assert!(events
            .lock()
            .contains(&ImportProgress::Volumes { decoded: 1, total: 1 }));
    }

    #[tokio::test]
    async fn test_stream_import_cancels() {
        let (_, bytes) = export_dataset_to_bytes(request(), &WriterOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let chunks = || {
            futures::stream::iter(
                bytes
                    .chunks(64)
                    .map(|c| Ok::<_, VoxError>(Bytes::copy_from_slice(c)))
                    .collect::<Vec<_>>(),
            )
        };
        let total = Some(bytes.len() as u64);

        let imported = import_archive_stream(chunks(), total, &ImportOptions::new())
            .await
            .unwrap();
        assert_eq!(imported.volume_count(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = import_archive_stream(
            chunks(),
            total,
            &ImportOptions::new().with_cancellation(cancel),
        )
        .await
        .unwrap_err();
        assert!(err.is_aborted());
    }
}
