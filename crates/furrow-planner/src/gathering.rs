//! Information gathering: turns screenshots and video frames into one
//! [`Observation`].
//!
//! A run proceeds in order:
//!
//! 1. Obtain frames (pre-supplied or extracted), optionally icon-replaced.
//! 2. Query the model once per frame, concurrently or one at a time, and
//!    index the answers by `(video_prefix, timestamp)`.
//! 3. Pull dialogue and the latest task guidance out of the index.
//! 4. Run the toolbar subtask (template matching plus per-slot counts) and
//!    the scene description query together.
//! 5. Merge object names and optionally run the object detector.
//!
//! Model I/O runs as futures on the calling task. Template matching is CPU
//! bound and runs on the blocking pool so the scene query is not held up by
//! it. Every model query retries until its answer parses. Any query that gives up, and
//! any detector failure, clears `flag` but the run carries on with what it has.

use futures_util::future::join_all;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use furrow_config::{DuplicatePolicy, GatheringConfig, StageFlags};
use furrow_providers::{assemble_prompt, LLMProvider, PromptParams};
use furrow_vision::{
    IconCatalog, PixelTemplateMatcher, SelectionBox, TemplateMatcher, VisionError,
};

use crate::collaborators::{Detection, FrameExtractor, FrameRef, IconReplacer, ObjectDetector};
use crate::errors::Cancelled;
use crate::frame_index::{
    video_prefix, FrameIndexStore, FrameKey, FrameRecord, TypedFact, DIALOGUE, NONE_MARKER,
};
use crate::response_parser::ParsedResponse;
use crate::retry::{
    cancellable_sleep, query_until_well_formed, until_cancelled, QueryError, RetryPolicy,
};
use crate::toolbar::{
    extract_number, match_toolbar_off_runtime, ToolbarEntry, ToolbarSnapshot,
};

/// Scene field naming what the object detector should look for
pub const TARGET_OBJECT_NAME: &str = "target_object_name";
/// Scene field listing visible objects
pub const OBJECTS: &str = "objects";
/// Scene field whose presence marks a successful gathering run
pub const DESCRIPTION: &str = "description";
/// Prompt value carrying the current task
pub const TASK_DESCRIPTION: &str = "task_description";
/// Prompt value carrying the item name in a slot count query
pub const INVENTORY_NAME: &str = "inventory_name";

/// Templates for the three kinds of gathering query
#[derive(Debug, Clone)]
pub struct GatherTemplates {
    /// Whole-scene description
    pub scene: String,
    /// Per-frame text (dialogue, task guidance)
    pub frame_text: String,
    /// Per-slot item count
    pub toolbar: String,
}

#[derive(Debug, Clone)]
pub struct GatherSettings {
    pub parallel_requests: bool,
    pub retry: RetryPolicy,
    pub stagger: Duration,
    pub duplicate_policy: DuplicatePolicy,
    pub selection_box: SelectionBox,
    pub box_threshold: f32,
    pub device: String,
}

impl GatherSettings {
    pub fn from_config(config: &GatheringConfig) -> Self {
        let mut retry = RetryPolicy::fixed(Duration::from_millis(config.retry_backoff_ms));
        retry.max_attempts = config.retry_max_attempts;

        let region = &config.selection_box;
        Self {
            parallel_requests: config.parallel_requests,
            retry,
            stagger: Duration::from_millis(config.stagger_ms),
            duplicate_policy: config.duplicate_policy,
            selection_box: SelectionBox::new(
                region.x,
                region.y,
                region.width,
                region.height,
                region.highlight_threshold,
            ),
            box_threshold: config.detector.box_threshold,
            device: config.detector.device.clone(),
        }
    }
}

impl Default for GatherSettings {
    fn default() -> Self {
        Self::from_config(&GatheringConfig::default())
    }
}

/// Perception services a gatherer can call on
#[derive(Clone)]
pub struct Collaborators {
    pub template_matcher: Arc<dyn TemplateMatcher>,
    pub icon_catalog: Arc<IconCatalog>,
    pub frame_extractor: Option<Arc<dyn FrameExtractor>>,
    pub icon_replacer: Option<Arc<dyn IconReplacer>>,
    pub object_detector: Option<Arc<dyn ObjectDetector>>,
}

impl Collaborators {
    pub fn new(template_matcher: Arc<dyn TemplateMatcher>, icon_catalog: IconCatalog) -> Self {
        Self {
            template_matcher,
            icon_catalog: Arc::new(icon_catalog),
            frame_extractor: None,
            icon_replacer: None,
            object_detector: None,
        }
    }

    /// Pixel matcher over the icon catalog directory named in `config`
    pub fn from_config(config: &GatheringConfig) -> Result<Self, VisionError> {
        let dir = shellexpand::tilde(&config.icon_catalog_dir).to_string();
        let catalog = IconCatalog::load(Path::new(&dir))?;
        info!("Loaded {} toolbar icons from {}", catalog.len(), dir);
        Ok(Self::new(
            Arc::new(PixelTemplateMatcher::new(config.match_threshold)),
            catalog,
        ))
    }

    pub fn with_frame_extractor(mut self, extractor: Arc<dyn FrameExtractor>) -> Self {
        self.frame_extractor = Some(extractor);
        self
    }

    pub fn with_icon_replacer(mut self, replacer: Arc<dyn IconReplacer>) -> Self {
        self.icon_replacer = Some(replacer);
        self
    }

    pub fn with_object_detector(mut self, detector: Arc<dyn ObjectDetector>) -> Self {
        self.object_detector = Some(detector);
        self
    }
}

/// Where frames for the per-frame queries come from
#[derive(Debug, Clone, Default)]
pub enum FrameSource {
    #[default]
    None,
    /// Frames already on disk; `source_id` names the clip they came from
    Frames {
        source_id: String,
        frames: Vec<FrameRef>,
    },
    /// A video the frame extractor samples
    Video(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct GatherRequest {
    pub stages: StageFlags,
    /// One screenshot per toolbar slot, left to right
    pub toolbar_screenshots: Vec<PathBuf>,
    pub frames: FrameSource,
    /// Parameters for the scene query; its first image feeds object detection
    pub scene_params: PromptParams,
    /// Parameters for each per-frame query; the last image is replaced by the frame
    pub frame_params: PromptParams,
    /// Parameters for each slot count query; the last image is replaced by the slot
    pub toolbar_params: PromptParams,
    /// Task description known before this run
    pub previous_task: Option<String>,
}

/// Everything one gathering run found out
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub objects: BTreeSet<String>,
    pub toolbar: ToolbarSnapshot,
    /// Latest real task guidance, else the previous task
    pub last_task_guidance: Option<String>,
    pub dialogues: Vec<TypedFact>,
    pub scene: Option<ParsedResponse>,
    pub detection: Option<Detection>,
    pub minimap: Option<Value>,
    /// The scene came back with a non-empty description
    pub success: bool,
    /// No query gave up and no detector call failed
    pub flag: bool,
    pub frames: FrameIndexStore,
}

/// Runs information gathering against one model backend
pub struct InformationGatherer {
    provider: Arc<dyn LLMProvider>,
    templates: GatherTemplates,
    settings: GatherSettings,
    collaborators: Collaborators,
}

impl InformationGatherer {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        templates: GatherTemplates,
        settings: GatherSettings,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            provider,
            templates,
            settings,
            collaborators,
        }
    }

    pub fn settings(&self) -> &GatherSettings {
        &self.settings
    }

    /// Run one gathering pass. Only cancellation is returned as an error;
    /// every other failure is reflected in [`Observation::flag`].
    pub async fn gather(
        &self,
        request: GatherRequest,
        cancel: &CancellationToken,
    ) -> Result<Observation, Cancelled> {
        let run_id = Uuid::new_v4();
        self.gather_inner(request, cancel)
            .instrument(info_span!("gather", %run_id))
            .await
    }

    async fn gather_inner(
        &self,
        mut request: GatherRequest,
        cancel: &CancellationToken,
    ) -> Result<Observation, Cancelled> {
        let stages = request.stages;
        let mut observation = Observation {
            flag: true,
            last_task_guidance: request.previous_task.clone(),
            ..Observation::default()
        };

        if stages.frame_extraction {
            info!("Using frame extractor to gather information");
            let (source_id, frames) = self.obtain_frames(&request.frames, cancel).await?;
            let frames = if stages.icon_replacement {
                self.replace_icons(frames, &mut observation.objects, cancel)
                    .await?
            } else {
                frames
            };

            let prefix = video_prefix(&source_id);
            let (store, frames_ok) = self
                .index_frames(&frames, &prefix, &request.frame_params, cancel)
                .await?;
            observation.flag &= frames_ok;

            observation.dialogues = store.search_type(DIALOGUE);
            if let Some(guidance) = store.latest_task_guidance() {
                info!("Current task from frames: {}", guidance);
                observation.last_task_guidance = Some(guidance);
            }
            observation.frames = store;
        }

        if let Some(task) = &observation.last_task_guidance {
            request.scene_params.set(TASK_DESCRIPTION, task.clone());
        }

        let ((toolbar, toolbar_ok), (scene, scene_ok)) = tokio::try_join!(
            self.toolbar_subtask(&request, cancel),
            self.scene_subtask(&request, cancel),
        )?;
        observation.toolbar = toolbar;
        observation.flag &= toolbar_ok && scene_ok;

        if let Some(scene) = &scene {
            observation.objects.extend(scene.list(OBJECTS));
        }

        if stages.object_detection {
            self.detect_objects(&request, scene.as_ref(), &mut observation, cancel)
                .await?;
        }

        observation.success = scene
            .as_ref()
            .and_then(|s| s.text(DESCRIPTION))
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false);
        observation.scene = scene;

        info!(
            "Finished gathering: success={}, flag={}, {} frames, {} objects",
            observation.success,
            observation.flag,
            observation.frames.len(),
            observation.objects.len()
        );
        Ok(observation)
    }

    async fn obtain_frames(
        &self,
        source: &FrameSource,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<FrameRef>), Cancelled> {
        match source {
            FrameSource::Frames { source_id, frames } => Ok((source_id.clone(), frames.clone())),
            FrameSource::Video(path) => {
                let source_id = path.to_string_lossy().to_string();
                let Some(extractor) = &self.collaborators.frame_extractor else {
                    warn!("Frame extractor is not set, skipping frame extraction");
                    return Ok((source_id, Vec::new()));
                };
                match until_cancelled(extractor.extract(path), cancel).await? {
                    Ok(frames) => Ok((source_id, frames)),
                    Err(e) => {
                        error!("Error in frame extraction: {}", e);
                        Ok((source_id, Vec::new()))
                    }
                }
            }
            FrameSource::None => {
                warn!("No frames or video supplied, skipping per-frame gathering");
                Ok((String::new(), Vec::new()))
            }
        }
    }

    async fn replace_icons(
        &self,
        frames: Vec<FrameRef>,
        objects: &mut BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FrameRef>, Cancelled> {
        info!("Using icon replacer to gather information");
        let Some(replacer) = &self.collaborators.icon_replacer else {
            warn!("Icon replacer is not set, skipping icon replacement");
            return Ok(frames);
        };

        let paths: Vec<PathBuf> = frames.iter().map(|f| f.path.clone()).collect();
        match until_cancelled(replacer.replace(&paths), cancel).await? {
            Ok(replacement) => {
                objects.extend(replacement.objects);
                if replacement.frame_paths.len() != frames.len() {
                    warn!(
                        "Icon replacer returned {} frames for {}, keeping originals",
                        replacement.frame_paths.len(),
                        frames.len()
                    );
                    return Ok(frames);
                }
                Ok(frames
                    .into_iter()
                    .zip(replacement.frame_paths)
                    .map(|(frame, path)| FrameRef::new(path, frame.timestamp))
                    .collect())
            }
            Err(e) => {
                error!("Error in gather information by icon replacer: {}", e);
                Ok(frames)
            }
        }
    }

    /// Query every frame and build the index. The bool is false when any
    /// frame query gave up or a record could not be stored.
    async fn index_frames(
        &self,
        frames: &[FrameRef],
        prefix: &str,
        params: &PromptParams,
        cancel: &CancellationToken,
    ) -> Result<(FrameIndexStore, bool), Cancelled> {
        let stagger = self.settings.stagger;

        let results = if self.settings.parallel_requests {
            info!("Start gathering text information from {} frames in parallel", frames.len());
            let tasks = frames.iter().enumerate().map(|(i, frame)| {
                self.query_frame(i, frame, prefix, params, stagger * i as u32, cancel)
            });
            until_cancelled(join_all(tasks), cancel).await?
        } else {
            info!("Start gathering text information from {} frames in sequence", frames.len());
            let mut results = Vec::with_capacity(frames.len());
            for (i, frame) in frames.iter().enumerate() {
                let delay = if i == 0 { Duration::ZERO } else { stagger };
                results.push(self.query_frame(i, frame, prefix, params, delay, cancel).await);
            }
            results
        };

        let mut store = FrameIndexStore::new();
        let mut all_ok = true;
        for result in results {
            let (key, record) = result?;
            match record {
                Some(record) => {
                    if let Err(e) = store.insert(key, record, self.settings.duplicate_policy) {
                        error!("{}", e);
                        all_ok = false;
                    }
                }
                None => all_ok = false,
            }
        }
        info!("Finish gathering text information from {} frames", store.len());
        Ok((store, all_ok))
    }

    async fn query_frame(
        &self,
        i: usize,
        frame: &FrameRef,
        prefix: &str,
        params: &PromptParams,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(FrameKey, Option<FrameRecord>), Cancelled> {
        let key = FrameKey::new(prefix, frame.timestamp);
        cancellable_sleep(delay, cancel).await?;

        info!("Start gathering text information from frame {}", i + 1);
        let params = params.with_last_image(&frame.path);
        let request = match assemble_prompt(&self.templates.frame_text, &params) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to assemble prompt for frame {}: {:#}", i + 1, e);
                return Ok((key, None));
            }
        };

        let label = format!("frame {}", i + 1);
        match query_until_well_formed(
            self.provider.as_ref(),
            &request,
            &self.settings.retry,
            cancel,
            &label,
        )
        .await
        {
            Ok(response) => {
                info!("Finish gathering text information from frame {}", i + 1);
                Ok((key, Some(FrameRecord::new(response.parsed.facts()))))
            }
            Err(QueryError::Cancelled(c)) => Err(c),
            Err(e) => {
                error!("{}", e);
                Ok((key, None))
            }
        }
    }

    async fn toolbar_subtask(
        &self,
        request: &GatherRequest,
        cancel: &CancellationToken,
    ) -> Result<(ToolbarSnapshot, bool), Cancelled> {
        let matched = until_cancelled(
            match_toolbar_off_runtime(
                Arc::clone(&self.collaborators.template_matcher),
                request.toolbar_screenshots.clone(),
                Arc::clone(&self.collaborators.icon_catalog),
                self.settings.selection_box.clone(),
            ),
            cancel,
        )
        .await?;

        let mut all_ok = true;
        let counts: Vec<u32> = if request.stages.item_counting && !matched.names.is_empty() {
            let stagger = self.settings.stagger;
            let queries = request
                .toolbar_screenshots
                .iter()
                .zip(&matched.names)
                .enumerate()
                .map(|(i, (shot, name))| {
                    let delay = if self.settings.parallel_requests {
                        stagger * i as u32
                    } else {
                        Duration::ZERO
                    };
                    self.count_slot(i, shot, name, &request.toolbar_params, delay, cancel)
                });

            let results = if self.settings.parallel_requests {
                until_cancelled(join_all(queries), cancel).await?
            } else {
                let mut results = Vec::with_capacity(matched.names.len());
                for (i, query) in queries.enumerate() {
                    if i > 0 {
                        cancellable_sleep(stagger, cancel).await?;
                    }
                    results.push(query.await);
                }
                results
            };

            let mut counts = Vec::with_capacity(results.len());
            for result in results {
                let (count, ok) = result?;
                all_ok &= ok;
                counts.push(count);
            }
            counts
        } else {
            vec![1; matched.names.len()]
        };

        let entries = matched
            .names
            .into_iter()
            .zip(counts)
            .enumerate()
            .map(|(i, (name, count))| ToolbarEntry {
                name,
                count,
                slot_position: i + 1,
            })
            .collect();

        Ok((
            ToolbarSnapshot {
                entries,
                selected_position: matched.selected_position,
            },
            all_ok,
        ))
    }

    /// Count for one slot and whether the query succeeded
    async fn count_slot(
        &self,
        i: usize,
        shot: &Path,
        name: &str,
        params: &PromptParams,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(u32, bool), Cancelled> {
        cancellable_sleep(delay, cancel).await?;

        let mut params = params.with_last_image(shot);
        params.set(INVENTORY_NAME, name.to_string());
        let request = match assemble_prompt(&self.templates.toolbar, &params) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to assemble prompt for slot {}: {:#}", i + 1, e);
                return Ok((1, false));
            }
        };

        let label = format!("slot {}", i + 1);
        match query_until_well_formed(
            self.provider.as_ref(),
            &request,
            &self.settings.retry,
            cancel,
            &label,
        )
        .await
        {
            Ok(response) => match extract_number(&response.raw) {
                Some(count) => Ok((count, true)),
                None => {
                    warn!("No item count for slot {} ({}), assuming 1", i + 1, name);
                    Ok((1, true))
                }
            },
            Err(QueryError::Cancelled(c)) => Err(c),
            Err(e) => {
                error!("{}", e);
                Ok((1, false))
            }
        }
    }

    async fn scene_subtask(
        &self,
        request: &GatherRequest,
        cancel: &CancellationToken,
    ) -> Result<(Option<ParsedResponse>, bool), Cancelled> {
        if !request.stages.scene_description {
            return Ok((None, true));
        }
        info!("Using llm description to gather information");

        let prompt = match assemble_prompt(&self.templates.scene, &request.scene_params) {
            Ok(prompt) => prompt,
            Err(e) => {
                error!("Error in gather image description information: {:#}", e);
                return Ok((None, false));
            }
        };

        match query_until_well_formed(
            self.provider.as_ref(),
            &prompt,
            &self.settings.retry,
            cancel,
            "scene description",
        )
        .await
        {
            Ok(response) => Ok((Some(response.parsed), true)),
            Err(QueryError::Cancelled(c)) => Err(c),
            Err(e) => {
                error!("{}", e);
                Ok((None, false))
            }
        }
    }

    async fn detect_objects(
        &self,
        request: &GatherRequest,
        scene: Option<&ParsedResponse>,
        observation: &mut Observation,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        info!("Using object detector to gather information");
        let Some(detector) = &self.collaborators.object_detector else {
            warn!("Object detector is not set, skipping object detection");
            return Ok(());
        };
        let Some(image) = request.scene_params.first_image_path() else {
            error!("No scene image for object detection");
            observation.flag = false;
            return Ok(());
        };

        let target = scene
            .and_then(|s| s.text(TARGET_OBJECT_NAME))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.contains(NONE_MARKER))
            .unwrap_or_default();

        let detected = detector.detect(
            image,
            &target,
            self.settings.box_threshold,
            &self.settings.device,
        );
        match until_cancelled(detected, cancel).await? {
            Ok(detection) => {
                observation.objects.extend(detection.labels.iter().cloned());
                observation.detection = Some(detection);
            }
            Err(e) => {
                error!("Error in gather information by object detector: {}", e);
                observation.flag = false;
            }
        }

        match until_cancelled(detector.detect_minimap(image), cancel).await? {
            Ok(minimap) => observation.minimap = Some(minimap),
            Err(e) => {
                error!("Error in gather information by object detector for minimap: {}", e);
                observation.flag = false;
            }
        }
        Ok(())
    }
}
