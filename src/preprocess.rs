//! Preprocessing orchestrator
//!
//! Turns raw input files into a multiscale chunked dataset. Each run goes
//! through the same phases for every layer:
//!
//! 1. **scan**: count timepoints (files in 3D mode, z-slices in 2D mode)
//! 2. **representative stats**: decode the middle timepoint and take its
//!    range as the layer normalization (not for segmentation layers)
//! 3. **shape validation**: every layer must share one spatial shape
//! 4. **write**: decode, normalize or colorize, and write each timepoint in
//!    increasing order
//! 5. **finalize**: write track sets and the root manifest
//!
//! Decoding is delegated to a [`VolumeLoader`]. Cancellation is polled at
//! every file, slice and timepoint boundary.

use crate::cancel::CancellationToken;
use crate::config::PreprocessOptions;
use crate::error::{Result, VoxError};
use crate::io::Store;
use crate::manifest::{AnisotropyCorrection, PreprocessedManifest};
use crate::progress::{emit, PreprocessProgress, ProgressCallback};
use crate::resample::{
    compute_anisotropy_scale, resample_volume, resampled_dims, AnisotropyScaleFactors, ResampleCache, ResampleMode,
};
use crate::store::{volume_name, ChannelInfo, DatasetInfo, DatasetWriter, LayerPlan};
use crate::tracks::TrackSet;
use crate::types::{AxisScale, Dims3, MovieMode, ValueRange};
use crate::volume::{
    colorize_segmentation, ensure_volume_within_ceiling, normalize_volume, VolumePayload,
    SEGMENTATION_CHANNELS,
};
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Decodes one raw input file into a typed volume.
#[async_trait]
pub trait VolumeLoader: Send + Sync {
    async fn load(&self, source: &str) -> Result<VolumePayload>;

    /// Number of z-slices in `source`; decodes the file unless overridden
    async fn frame_count(&self, source: &str) -> Result<usize> {
        Ok(self.load(source).await?.depth)
    }
}

/// Input files of one layer, in timepoint order
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInput {
    pub key: String,
    pub label: String,
    pub channel_id: String,
    pub is_segmentation: bool,
    pub files: Vec<String>,
}

impl LayerInput {
    pub fn new(key: impl Into<String>, channel_id: impl Into<String>, files: Vec<String>) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            channel_id: channel_id.into(),
            is_segmentation: false,
            files,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn segmentation(mut self) -> Self {
        self.is_segmentation = true;
        self
    }
}

/// Everything one preprocessing run consumes
#[derive(Debug, Clone, Default)]
pub struct PreprocessRequest {
    pub channels: Vec<ChannelInfo>,
    pub layers: Vec<LayerInput>,
    pub track_sets: Vec<TrackSet>,
}

/// Run `job(i)` for every `i < count` on up to `workers` concurrent workers.
///
/// Workers claim the next unclaimed index from a shared counter; results are
/// returned in index order. The first error (or a cancellation) stops all
/// workers from claiming further work.
pub async fn run_worker_pool<T, F, Fut>(
    count: usize,
    workers: usize,
    cancel: &CancellationToken,
    job: F,
) -> Result<Vec<T>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<T>>> = Mutex::new((0..count).map(|_| None).collect());
    let workers = workers.clamp(1, count.max(1));

    let (next, slots, job) = (&next, &slots, &job);
    let worker = move || async move {
        loop {
            cancel.check()?;
            let index = next.fetch_add(1, Ordering::SeqCst);
            if index >= count {
                return Ok::<(), VoxError>(());
            }
            let value = job(index).await?;
            slots.lock()[index] = Some(value);
        }
    };
    try_join_all((0..workers).map(|_| worker())).await?;

    let mut results = Vec::with_capacity(count);
    for (index, slot) in std::mem::take(&mut *slots.lock()).into_iter().enumerate() {
        results.push(slot.ok_or_else(|| VoxError::Corrupt(format!("worker result {} missing", index)))?);
    }
    Ok(results)
}

/// File and z-slice holding frame `timepoint` of a 2D stack.
///
/// Frames are numbered from 1 across the concatenated files, so valid
/// timepoints run `1..=count_2d_timepoints(depths)`. Files with no frames
/// are skipped.
pub fn resolve_2d_file_slice_for_timepoint(depths: &[usize], timepoint: usize) -> Option<(usize, usize)> {
    let mut remaining = timepoint.checked_sub(1)?;
    for (file, &depth) in depths.iter().enumerate() {
        if remaining < depth {
            return Some((file, remaining));
        }
        remaining -= depth;
    }
    None
}

/// Total frames of a 2D stack; the last valid frame number
pub fn count_2d_timepoints(depths: &[usize]) -> usize {
    depths.iter().sum()
}

struct ScannedLayer {
    input: LayerInput,
    /// Per-file depths in 2D mode
    depths: Option<Vec<usize>>,
    timepoints: usize,
}

/// Decodes timepoints of one layer, keeping the last decoded file so
/// consecutive slices of a 2D stack share one decode.
struct FrameSource<'a, L: VolumeLoader + ?Sized> {
    loader: &'a L,
    layer: &'a ScannedLayer,
    cached: Option<(usize, VolumePayload)>,
}

impl<'a, L: VolumeLoader + ?Sized> FrameSource<'a, L> {
    fn new(loader: &'a L, layer: &'a ScannedLayer) -> Self {
        Self {
            loader,
            layer,
            cached: None,
        }
    }

    async fn load(&mut self, timepoint: usize, ceiling: u64) -> Result<VolumePayload> {
        let files = &self.layer.input.files;
        let Some(depths) = &self.layer.depths else {
            let source = files.get(timepoint).ok_or_else(|| out_of_range(&self.layer.input.key, timepoint))?;
            let payload = self.loader.load(source).await?;
            payload.ensure_within_ceiling(ceiling)?;
            return Ok(payload);
        };

        // Written timepoints are zero-based, stack frames are numbered from 1
        let (file, slice) = resolve_2d_file_slice_for_timepoint(depths, timepoint + 1)
            .ok_or_else(|| out_of_range(&self.layer.input.key, timepoint))?;
        if self.cached.as_ref().map(|(index, _)| *index) != Some(file) {
            let payload = self.loader.load(&files[file]).await?;
            payload.ensure_within_ceiling(ceiling)?;
            if payload.depth != depths[file] {
                return Err(VoxError::Configuration(format!(
                    "{} reported {} frames but decoded {}",
                    files[file], depths[file], payload.depth
                )));
            }
            self.cached = Some((file, payload));
        }
        match &self.cached {
            Some((_, payload)) => payload.extract_z_slice(slice),
            None => Err(out_of_range(&self.layer.input.key, timepoint)),
        }
    }
}

fn out_of_range(layer_key: &str, timepoint: usize) -> VoxError {
    VoxError::OutOfBounds(format!("{} has no input", volume_name(layer_key, timepoint)))
}

/// Drives a preprocessing run over a [`VolumeLoader`].
pub struct Preprocessor<L: VolumeLoader + ?Sized> {
    loader: Arc<L>,
    options: PreprocessOptions,
    cancel: CancellationToken,
    progress: Option<ProgressCallback<PreprocessProgress>>,
}

impl<L: VolumeLoader + ?Sized> Preprocessor<L> {
    pub fn new(loader: Arc<L>, options: PreprocessOptions) -> Self {
        Self {
            loader,
            options,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback<PreprocessProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn options(&self) -> &PreprocessOptions {
        &self.options
    }

    /// Preprocess `request` into `store` and return the finalized manifest.
    pub async fn run<S: Store + ?Sized>(
        &self,
        store: Arc<S>,
        request: PreprocessRequest,
    ) -> Result<PreprocessedManifest> {
        let result = self.run_phases(store, request).await;
        if let Err(e) = &result {
            if e.is_aborted() {
                info!("preprocessing cancelled");
            }
        }
        result
    }

    fn anisotropy_scale(&self) -> Option<AnisotropyScaleFactors> {
        let anisotropy = &self.options.anisotropy;
        let resolution = anisotropy.voxel_resolution.as_ref()?;
        compute_anisotropy_scale(anisotropy.enabled, resolution.spacing())
    }

    async fn run_phases<S: Store + ?Sized>(
        &self,
        store: Arc<S>,
        request: PreprocessRequest,
    ) -> Result<PreprocessedManifest> {
        self.options.validate()?;
        if request.layers.is_empty() {
            return Err(VoxError::Configuration("no layers to preprocess".to_string()));
        }
        let ceiling = self.options.writer.max_volume_bytes;
        let scale = self.anisotropy_scale();

        // Scan
        let mut scanned = Vec::with_capacity(request.layers.len());
        for input in request.layers {
            self.cancel.check()?;
            scanned.push(self.scan_layer(input).await?);
        }

        let timepoints = scanned[0].timepoints;
        if let Some(other) = scanned.iter().find(|layer| layer.timepoints != timepoints) {
            return Err(VoxError::Configuration(format!(
                "layer '{}' has {} timepoints but layer '{}' has {}",
                other.input.key, other.timepoints, scanned[0].input.key, timepoints
            )));
        }
        if timepoints == 0 {
            return Err(VoxError::Configuration("inputs contain no timepoints".to_string()));
        }

        // Representative stats and shape validation
        let representative_timepoint = timepoints / 2;
        let mut cache = ResampleCache::new();
        let mut plans = Vec::with_capacity(scanned.len());
        let mut representatives = Vec::with_capacity(scanned.len());
        for layer in &scanned {
            self.cancel.check()?;
            let mut frames = FrameSource::new(self.loader.as_ref(), layer);
            let raw = frames.load(representative_timepoint, ceiling).await?;
            let payload = self.correct(Some(&mut cache), layer, representative_timepoint, raw, scale)?;

            let normalization = if layer.input.is_segmentation {
                None
            } else {
                let range = ValueRange::corrected(payload.min, payload.max);
                debug!(layer = %layer.input.key, min = range.min, max = range.max, "representative stats");
                emit(
                    &self.progress,
                    PreprocessProgress::RepresentativeStats {
                        layer_key: layer.input.key.clone(),
                        min: range.min,
                        max: range.max,
                    },
                );
                Some(range)
            };

            plans.push(LayerPlan {
                key: layer.input.key.clone(),
                label: layer.input.label.clone(),
                channel_id: layer.input.channel_id.clone(),
                is_segmentation: layer.input.is_segmentation,
                volume_count: timepoints,
                dims: payload.dims(),
                channels: if layer.input.is_segmentation {
                    SEGMENTATION_CHANNELS
                } else {
                    payload.channels
                },
                data_type: payload.data_type(),
                normalization,
            });
            // Corrected representatives stay in the resample cache until written
            representatives.push(scale.is_none().then_some(payload));
        }

        let reference = plans[0].dims;
        if let Some(plan) = plans.iter().find(|plan| plan.dims != reference) {
            return Err(VoxError::Configuration(format!(
                "layer '{}' is {} but layer '{}' is {}",
                plan.key, plan.dims, plans[0].key, reference
            )));
        }

        // Write
        let mut writer = DatasetWriter::create(store.clone(), self.options.writer.clone()).await?;
        for plan in &plans {
            writer.add_layer(plan.clone()).await?;
        }
        for ((layer, plan), representative) in scanned.iter().zip(&plans).zip(representatives) {
            let mut frames = FrameSource::new(self.loader.as_ref(), layer);
            let mut representative = representative;
            for timepoint in 0..timepoints {
                self.cancel.check()?;
                let reused = if timepoint == representative_timepoint {
                    representative.take().or_else(|| cache.get(&plan.key, timepoint))
                } else {
                    None
                };
                let payload = match reused {
                    Some(payload) => payload,
                    None => {
                        let raw = frames.load(timepoint, ceiling).await?;
                        self.correct(None, layer, timepoint, raw, scale)?
                    }
                };
                cache.invalidate(&plan.key, timepoint);

                if payload.dims() != plan.dims {
                    return Err(VoxError::Configuration(format!(
                        "{} is {} but the layer reference is {}",
                        volume_name(&plan.key, timepoint),
                        payload.dims(),
                        plan.dims
                    )));
                }
                let volume = match plan.normalization {
                    None => colorize_segmentation(&payload, &plan.key, timepoint)?,
                    Some(range) => normalize_volume(&payload, range)?,
                };
                self.cancel.check()?;
                writer.write_timepoint(&plan.key, timepoint, &volume).await?;
                emit(
                    &self.progress,
                    PreprocessProgress::Timepoint {
                        layer_key: plan.key.clone(),
                        timepoint,
                        timepoints_total: timepoints,
                    },
                );
            }
            info!(layer = %plan.key, timepoints, "wrote layer");
        }

        // Finalize
        self.cancel.check()?;
        for track_set in &request.track_sets {
            store.write(&track_set.path(), track_set.to_csv()?.as_bytes()).await?;
        }
        let anisotropy_correction = self.options.anisotropy.enabled.then(|| AnisotropyCorrection {
            enabled: scale.is_some(),
            scale: scale.unwrap_or(AxisScale::IDENTITY),
        });
        let info = DatasetInfo::new(self.options.movie_mode, request.channels)
            .with_track_sets(request.track_sets.iter().map(TrackSet::manifest_entry).collect())
            .with_voxel_resolution(self.options.anisotropy.voxel_resolution.clone())
            .with_anisotropy_correction(anisotropy_correction);
        let manifest = writer.finish(info).await?;
        emit(
            &self.progress,
            PreprocessProgress::Finalized {
                total_volume_count: manifest.dataset.total_volume_count,
            },
        );
        Ok(manifest)
    }

    async fn scan_layer(&self, input: LayerInput) -> Result<ScannedLayer> {
        if input.files.is_empty() {
            return Err(VoxError::Configuration(format!(
                "layer '{}' has no input files",
                input.key
            )));
        }
        let total = input.files.len();

        let (depths, timepoints) = match self.options.movie_mode {
            MovieMode::ThreeD => {
                emit(
                    &self.progress,
                    PreprocessProgress::Scan {
                        layer_key: input.key.clone(),
                        files_done: total,
                        files_total: total,
                    },
                );
                (None, total)
            }
            MovieMode::TwoD => {
                let done = AtomicUsize::new(0);
                let loader = self.loader.as_ref();
                let progress = &self.progress;
                let (files, key, done) = (&input.files, &input.key, &done);
                let depths = run_worker_pool(total, self.options.workers, &self.cancel, move |index| async move {
                    let depth = loader.frame_count(&files[index]).await?;
                    let files_done = done.fetch_add(1, Ordering::SeqCst) + 1;
                    emit(
                        progress,
                        PreprocessProgress::Scan {
                            layer_key: key.clone(),
                            files_done,
                            files_total: total,
                        },
                    );
                    Ok(depth)
                })
                .await?;
                let timepoints = count_2d_timepoints(&depths);
                (Some(depths), timepoints)
            }
        };

        info!(
            layer = %input.key,
            files = total,
            timepoints,
            mode = self.options.movie_mode.as_str(),
            "scanned layer"
        );
        Ok(ScannedLayer {
            input,
            depths,
            timepoints,
        })
    }

    /// Apply anisotropy correction, nearest-neighbour for label volumes.
    /// Results are kept in `cache` when one is given.
    fn correct(
        &self,
        cache: Option<&mut ResampleCache>,
        layer: &ScannedLayer,
        timepoint: usize,
        payload: VolumePayload,
        scale: Option<AnisotropyScaleFactors>,
    ) -> Result<Arc<VolumePayload>> {
        let Some(scale) = scale else {
            return Ok(Arc::new(payload));
        };
        ensure_volume_within_ceiling(
            resampled_dims(payload.dims(), scale),
            payload.channels,
            payload.data_type(),
            self.options.writer.max_volume_bytes,
        )?;
        let mode = if layer.input.is_segmentation {
            ResampleMode::Nearest
        } else {
            ResampleMode::Trilinear
        };
        match cache {
            Some(cache) => cache.get_or_resample(&layer.input.key, timepoint, &payload, scale, mode),
            None => Ok(Arc::new(resample_volume(&payload, scale, mode)?)),
        }
    }
}

/// Spatial shape shared by every layer of a finished manifest
pub fn dataset_dims(manifest: &PreprocessedManifest) -> Option<Dims3> {
    manifest.layers().next().map(|layer| layer.dims())
}
