//! Information gathering driven end to end against the mock provider.
//!
//! Frames are small files whose bytes name them (`frame-0`, `frame-1`, ...);
//! the responder decodes the attached image to decide which frame it is
//! answering for.

use async_trait::async_trait;
use base64::Engine;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use furrow_config::{DuplicatePolicy, StageFlags};
use furrow_planner::{
    Cancelled, Collaborators, Detection, FrameExtractor, FrameRef, FrameSource, GatherRequest,
    GatherSettings, GatherTemplates, IconReplacement, IconReplacer, InformationGatherer,
    ObjectDetector, RetryPolicy, StageRunner,
};
use furrow_providers::{CompletionRequest, MockProvider, MockResponse, PromptParams};
use furrow_vision::{IconCatalog, IconMatch, SelectionBox, TemplateMatcher, VisionError};

const SCENE: &str = "SCENE task=<$task_description$>";
const FRAME: &str = "FRAME";
const TOOLBAR: &str = "TOOLBAR <$inventory_name$>";

fn system(request: &CompletionRequest) -> &str {
    &request.messages[0].content
}

/// Decoded bytes of the last image in the request
fn payload(request: &CompletionRequest) -> String {
    let image = request
        .messages
        .iter()
        .flat_map(|m| m.images.iter())
        .last()
        .expect("request carries an image");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&image.data)
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Frame `i` at `timestamps[i]`, with contents `frame-i`
    fn frames(&self, timestamps: &[f64]) -> Vec<FrameRef> {
        timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| {
                let name = format!("frame-{}", i);
                FrameRef::new(self.file(&format!("{}.png", name), &name), *ts)
            })
            .collect()
    }
}

/// Names slots after their file stem (`x*` stays unknown) and selects `*_sel.png`
struct StemMatcher;

impl TemplateMatcher for StemMatcher {
    fn best_match(
        &self,
        screenshot: &Path,
        _catalog: &IconCatalog,
    ) -> Result<Option<IconMatch>, VisionError> {
        let stem = screenshot.file_stem().unwrap().to_str().unwrap();
        if stem.starts_with('x') {
            return Ok(None);
        }
        Ok(Some(IconMatch {
            name: stem.trim_end_matches("_sel").to_string(),
            distance: 0.0,
        }))
    }

    fn is_selected(&self, screenshot: &Path, _region: &SelectionBox) -> Result<bool, VisionError> {
        Ok(screenshot.to_str().unwrap().ends_with("_sel.png"))
    }

    fn name(&self) -> &str {
        "stem"
    }
}

struct FixedExtractor(Result<Vec<FrameRef>, String>);

#[async_trait]
impl FrameExtractor for FixedExtractor {
    async fn extract(&self, _source: &Path) -> anyhow::Result<Vec<FrameRef>> {
        self.0.clone().map_err(anyhow::Error::msg)
    }
}

struct NamingReplacer {
    objects: Vec<String>,
    fail: bool,
}

#[async_trait]
impl IconReplacer for NamingReplacer {
    async fn replace(&self, frame_paths: &[PathBuf]) -> anyhow::Result<IconReplacement> {
        if self.fail {
            anyhow::bail!("icon model not loaded");
        }
        Ok(IconReplacement {
            frame_paths: frame_paths.to_vec(),
            objects: self.objects.clone(),
        })
    }
}

#[derive(Default)]
struct RecordingDetector {
    labels: Vec<String>,
    fail: bool,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectDetector for RecordingDetector {
    async fn detect(
        &self,
        _image: &Path,
        prompt: &str,
        _box_threshold: f32,
        _device: &str,
    ) -> anyhow::Result<Detection> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail {
            anyhow::bail!("detector out of memory");
        }
        Ok(Detection {
            boxes: vec![[0.0, 0.0, 1.0, 1.0]; self.labels.len()],
            scores: vec![0.9; self.labels.len()],
            labels: self.labels.clone(),
        })
    }

    async fn detect_minimap(&self, _image: &Path) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "player": [3, 4] }))
    }
}

fn templates() -> GatherTemplates {
    GatherTemplates {
        scene: SCENE.to_string(),
        frame_text: FRAME.to_string(),
        toolbar: TOOLBAR.to_string(),
    }
}

fn collaborators() -> Collaborators {
    Collaborators::new(Arc::new(StemMatcher), IconCatalog::default())
}

fn fast_settings(parallel: bool) -> GatherSettings {
    GatherSettings {
        parallel_requests: parallel,
        retry: RetryPolicy::immediate(),
        stagger: Duration::ZERO,
        ..GatherSettings::default()
    }
}

fn gatherer(
    provider: &MockProvider,
    settings: GatherSettings,
    collaborators: Collaborators,
) -> InformationGatherer {
    InformationGatherer::new(Arc::new(provider.clone()), templates(), settings, collaborators)
}

fn stages(frames: bool, counting: bool, scene: bool) -> StageFlags {
    StageFlags {
        frame_extraction: frames,
        icon_replacement: false,
        object_detection: false,
        item_counting: counting,
        scene_description: scene,
    }
}

fn frame_request(source_id: &str, frames: Vec<FrameRef>, scene: bool) -> GatherRequest {
    GatherRequest {
        stages: stages(true, false, scene),
        frames: FrameSource::Frames {
            source_id: source_id.to_string(),
            frames,
        },
        ..GatherRequest::default()
    }
}

/// Answers frame queries from `scripts` (keyed by frame payload) and the
/// scene query with `scene`
fn scripted(scripts: &[(&str, &str)], scene: &str) -> MockProvider {
    let scripts: HashMap<String, String> = scripts
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let scene = scene.to_string();
    MockProvider::new().with_responder(move |req| {
        if system(req).starts_with(FRAME) {
            let text = scripts.get(&payload(req)).cloned().unwrap_or_default();
            MockResponse::text(&text)
        } else {
            MockResponse::text(&scene)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_and_sequential_stores_match() {
    for n in [0usize, 1, 5] {
        let fx = Fixture::new();
        let timestamps: Vec<f64> = (0..n).map(|i| ((i * 3) % 5) as f64 + 0.5).collect();
        let frames = fx.frames(&timestamps);
        let provider = MockProvider::new().with_responder(|req| {
            MockResponse::text(&format!(
                "Dialogue:\nline from {}\n\nTask guidance:\nnone",
                payload(req)
            ))
        });

        let mut stores = Vec::new();
        for parallel in [true, false] {
            let settings = GatherSettings {
                parallel_requests: parallel,
                ..GatherSettings::default()
            };
            let observation = gatherer(&provider, settings, collaborators())
                .gather(
                    frame_request("run_7.mp4", frames.clone(), false),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(observation.flag);
            assert_eq!(observation.frames.len(), n);
            stores.push(
                observation
                    .frames
                    .iter()
                    .map(|(k, r)| (k.clone(), r.clone()))
                    .collect::<Vec<_>>(),
            );
        }

        assert_eq!(stores[0], stores[1], "stores differ for {} frames", n);
        let timestamps: Vec<f64> = stores[0].iter().map(|(k, _)| k.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn test_dialogue_facts_carry_their_frame() {
    let fx = Fixture::new();
    let frames = fx.frames(&[1.0, 2.0, 3.0]);
    let provider = scripted(
        &[
            ("frame-0", "Dialogue:\nHello there"),
            ("frame-1", "Dialogue:\nSee you tomorrow"),
            ("frame-2", "Item:\nparsnip seeds"),
        ],
        "",
    );

    let observation = gatherer(&provider, fast_settings(true), collaborators())
        .gather(
            frame_request("clips/day_1.mp4", frames, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let dialogues: Vec<(f64, String)> = observation
        .dialogues
        .iter()
        .map(|f| (f.key.timestamp, f.text()))
        .collect();
    assert_eq!(
        dialogues,
        vec![
            (1.0, "Hello there".to_string()),
            (2.0, "See you tomorrow".to_string())
        ]
    );
    assert!(observation.dialogues.iter().all(|f| f.key.video_prefix == "1"));
    assert_eq!(observation.frames.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_with_repeated_speaker_is_queried_once() {
    let fx = Fixture::new();
    let frames = fx.frames(&[4.0]);
    let provider = scripted(
        &[(
            "frame-0",
            "Dialogue:\nAbigail:\nHi there\nSam:\nHey\nAbigail:\nBye\n\nTask guidance:\nnone",
        )],
        "",
    );

    let observation = gatherer(&provider, GatherSettings::default(), collaborators())
        .gather(
            frame_request("day_2.mp4", frames, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(provider.request_count(), 1);
    assert!(observation.flag);
    assert_eq!(observation.dialogues.len(), 1);
    assert_eq!(
        observation.dialogues[0].text(),
        "Abigail:\nHi there\nSam:\nHey\nAbigail:\nBye"
    );
}

#[tokio::test]
async fn test_latest_real_task_guidance_reaches_scene_prompt() {
    let fx = Fixture::new();
    let frames = fx.frames(&[2.0, 1.0]);
    let provider = scripted(
        &[
            ("frame-0", "Task guidance:\ngo fishing"),
            ("frame-1", "Task guidance:\nNone task"),
        ],
        "Description:\nA pond at noon",
    );

    let mut request = frame_request("day_3.mp4", frames, true);
    request.previous_task = Some("water crops".to_string());
    let observation = gatherer(&provider, fast_settings(true), collaborators())
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(observation.last_task_guidance.as_deref(), Some("go fishing"));
    assert!(observation.success);
    let scene_prompts: Vec<String> = provider
        .get_requests()
        .iter()
        .filter(|r| system(r).starts_with("SCENE"))
        .map(|r| system(r).to_string())
        .collect();
    assert_eq!(scene_prompts, vec!["SCENE task=go fishing".to_string()]);
}

#[tokio::test]
async fn test_task_guidance_all_none_keeps_previous_task() {
    let fx = Fixture::new();
    let provider = scripted(
        &[
            ("frame-0", "Task guidance:\nnone"),
            ("frame-1", "Task guidance:\nNONE yet"),
        ],
        "",
    );
    let gatherer = gatherer(&provider, fast_settings(false), collaborators());

    let mut request = frame_request("day_3.mp4", fx.frames(&[1.0, 2.0]), false);
    request.previous_task = Some("water crops".to_string());
    let observation = gatherer
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(observation.last_task_guidance.as_deref(), Some("water crops"));

    let request = frame_request("day_3.mp4", fx.frames(&[1.0, 2.0]), false);
    let observation = gatherer
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(observation.last_task_guidance, None);
}

#[tokio::test]
async fn test_toolbar_slots_are_dense_and_counted() {
    let fx = Fixture::new();
    let shots = vec![
        fx.file("axe.png", "axe"),
        fx.file("hoe_sel.png", "hoe"),
        fx.file("x_blank.png", "blank"),
        fx.file("rod_sel.png", "rod"),
    ];
    let provider = MockProvider::new().with_responder(|req| {
        let text = match system(req) {
            "TOOLBAR axe" => "Number: 2",
            "TOOLBAR hoe" => "Number: 5",
            _ => "I cannot tell how many there are",
        };
        MockResponse::text(text)
    });

    let request = GatherRequest {
        stages: stages(false, true, false),
        toolbar_screenshots: shots.clone(),
        toolbar_params: PromptParams::new().with_image("Slot:", "placeholder.png"),
        ..GatherRequest::default()
    };
    let observation = gatherer(&provider, fast_settings(true), collaborators())
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();

    let entries: Vec<(String, u32, usize)> = observation
        .toolbar
        .entries
        .iter()
        .map(|e| (e.name.clone(), e.count, e.slot_position))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("axe".to_string(), 2, 1),
            ("hoe".to_string(), 5, 2),
            ("unknown".to_string(), 1, 3),
            ("rod".to_string(), 1, 4),
        ]
    );
    assert_eq!(observation.toolbar.selected_position, Some(2));
    assert!(observation.flag);

    // Each count query carries its own slot image
    let payloads: BTreeSet<String> = provider.get_requests().iter().map(payload).collect();
    assert_eq!(
        payloads,
        ["axe", "hoe", "blank", "rod"].iter().map(|s| s.to_string()).collect()
    );
}

#[tokio::test]
async fn test_toolbar_without_item_counting() {
    let fx = Fixture::new();
    let provider = MockProvider::new();
    let request = GatherRequest {
        stages: stages(false, false, false),
        toolbar_screenshots: vec![fx.file("axe.png", "a"), fx.file("hoe.png", "h")],
        ..GatherRequest::default()
    };

    let observation = gatherer(&provider, fast_settings(true), collaborators())
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(observation.toolbar.entries.len(), 2);
    assert!(observation.toolbar.entries.iter().all(|e| e.count == 1));
    assert_eq!(observation.toolbar.selected_position, None);
    assert_eq!(provider.request_count(), 0);
}

/// Holds the matching thread until the provider has seen a request
struct WaitForSceneMatcher {
    provider: MockProvider,
    scene_seen: Arc<AtomicBool>,
}

impl TemplateMatcher for WaitForSceneMatcher {
    fn best_match(
        &self,
        _screenshot: &Path,
        _catalog: &IconCatalog,
    ) -> Result<Option<IconMatch>, VisionError> {
        for _ in 0..300 {
            if self.provider.request_count() > 0 {
                self.scene_seen.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(None)
    }

    fn is_selected(&self, _screenshot: &Path, _region: &SelectionBox) -> Result<bool, VisionError> {
        Ok(false)
    }

    fn name(&self) -> &str {
        "wait-for-scene"
    }
}

#[tokio::test]
async fn test_scene_query_is_sent_while_toolbar_matching_runs() {
    let fx = Fixture::new();
    let provider =
        MockProvider::new().with_default_response(MockResponse::text("Description:\nA barn"));
    let scene_seen = Arc::new(AtomicBool::new(false));
    let matcher = WaitForSceneMatcher {
        provider: provider.clone(),
        scene_seen: Arc::clone(&scene_seen),
    };
    let request = GatherRequest {
        stages: stages(false, false, true),
        toolbar_screenshots: vec![fx.file("axe.png", "a")],
        ..GatherRequest::default()
    };

    let observation = gatherer(
        &provider,
        fast_settings(true),
        Collaborators::new(Arc::new(matcher), IconCatalog::default()),
    )
    .gather(request, &CancellationToken::new())
    .await
    .unwrap();

    assert!(scene_seen.load(Ordering::SeqCst));
    assert!(observation.success);
    assert_eq!(observation.toolbar.entries[0].name, "unknown");
}

#[tokio::test(start_paused = true)]
async fn test_two_bad_parses_cost_two_backoffs_but_stages_fail_at_once() {
    let script = || {
        vec![
            MockResponse::text("{ \"description\": "),
            MockResponse::text("```\nDescription: A barn"),
            MockResponse::text("Description:\nA barn at dusk"),
        ]
    };

    let provider = MockProvider::new().with_responses(script());
    let request = GatherRequest {
        stages: stages(false, false, true),
        ..GatherRequest::default()
    };
    let start = tokio::time::Instant::now();
    let observation = gatherer(&provider, GatherSettings::default(), collaborators())
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(observation.success);
    assert!(observation.flag);
    assert_eq!(provider.request_count(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(4));

    let provider = MockProvider::new().with_responses(script());
    let stage = StageRunner::new("success_detection", SCENE, Arc::new(provider.clone()));
    let start = tokio::time::Instant::now();
    let outcome = stage.run(&PromptParams::new()).await;

    assert!(!outcome.flag);
    assert_eq!(provider.request_count(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn test_objects_merge_into_one_set() {
    let fx = Fixture::new();
    let detector = Arc::new(RecordingDetector {
        labels: vec!["torch".to_string()],
        ..RecordingDetector::default()
    });
    let collaborators = collaborators()
        .with_icon_replacer(Arc::new(NamingReplacer {
            objects: vec!["torch".to_string(), "axe".to_string()],
            fail: false,
        }))
        .with_object_detector(detector.clone());
    let provider = scripted(
        &[("frame-0", "Dialogue:\nCareful in the mines")],
        "Description:\nA dark mine\n\nObjects:\ntorch, axe\n\nTarget object name:\nNone",
    );

    let request = GatherRequest {
        stages: StageFlags {
            frame_extraction: true,
            icon_replacement: true,
            object_detection: true,
            item_counting: false,
            scene_description: true,
        },
        frames: FrameSource::Frames {
            source_id: "mine_2.mp4".to_string(),
            frames: fx.frames(&[0.5]),
        },
        scene_params: PromptParams::new().with_image("Current screen:", fx.file("scene.png", "scene")),
        ..GatherRequest::default()
    };
    let observation = gatherer(&provider, fast_settings(true), collaborators)
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();

    let expected: BTreeSet<String> = ["axe", "torch"].iter().map(|s| s.to_string()).collect();
    assert_eq!(observation.objects, expected);
    assert_eq!(*detector.prompts.lock().unwrap(), vec![String::new()]);
    assert_eq!(observation.detection.unwrap().labels, vec!["torch"]);
    assert!(observation.minimap.is_some());
    assert!(observation.success);
    assert!(observation.flag);
}

#[tokio::test]
async fn test_detector_failure_clears_flag_only() {
    let fx = Fixture::new();
    let detector = Arc::new(RecordingDetector {
        fail: true,
        ..RecordingDetector::default()
    });
    let provider = scripted(&[], "Description:\nA field\n\nTarget object name:\nTree");

    let request = GatherRequest {
        stages: StageFlags {
            frame_extraction: false,
            icon_replacement: false,
            object_detection: true,
            item_counting: false,
            scene_description: true,
        },
        scene_params: PromptParams::new().with_image("Current screen:", fx.file("scene.png", "scene")),
        ..GatherRequest::default()
    };
    let observation = gatherer(
        &provider,
        fast_settings(true),
        collaborators().with_object_detector(detector.clone()),
    )
    .gather(request, &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(*detector.prompts.lock().unwrap(), vec!["tree".to_string()]);
    assert!(observation.success);
    assert!(!observation.flag);
    assert!(observation.detection.is_none());
}

#[tokio::test]
async fn test_icon_replacer_failure_keeps_original_frames() {
    let fx = Fixture::new();
    let provider = scripted(&[("frame-0", "Dialogue:\nstill read")], "");
    let mut request = frame_request("run_1.mp4", fx.frames(&[1.0]), false);
    request.stages.icon_replacement = true;

    let observation = gatherer(
        &provider,
        fast_settings(true),
        collaborators().with_icon_replacer(Arc::new(NamingReplacer {
            objects: vec!["torch".to_string()],
            fail: true,
        })),
    )
    .gather(request, &CancellationToken::new())
    .await
    .unwrap();

    assert!(observation.flag);
    assert!(observation.objects.is_empty());
    assert_eq!(observation.dialogues[0].text(), "still read");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_with_outstanding_frames() {
    let fx = Fixture::new();
    let frames = fx.frames(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    let provider = MockProvider::new().with_responder(|req| match payload(req).as_str() {
        "frame-0" | "frame-1" => MockResponse::text("Dialogue:\nfast"),
        _ => MockResponse::pending(),
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = gatherer(&provider, fast_settings(true), collaborators())
        .gather(frame_request("run_1.mp4", frames, true), &cancel)
        .await;

    assert_eq!(result.unwrap_err(), Cancelled);
    assert_eq!(provider.request_count(), 5);
    assert_eq!(provider.completed_count(), 2);
    assert_eq!(provider.in_flight(), 0);
}

#[tokio::test]
async fn test_duplicate_frame_policies() {
    let fx = Fixture::new();
    let frames = vec![
        FrameRef::new(fx.file("a.png", "first"), 4.0),
        FrameRef::new(fx.file("b.png", "second"), 4.0),
    ];
    let provider = scripted(
        &[("first", "Dialogue:\nfirst"), ("second", "Dialogue:\nsecond")],
        "",
    );

    let overwrite = GatherSettings {
        duplicate_policy: DuplicatePolicy::Overwrite,
        ..fast_settings(true)
    };
    let observation = gatherer(&provider, overwrite, collaborators())
        .gather(frame_request("run_1.mp4", frames.clone(), false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(observation.flag);
    assert_eq!(observation.frames.len(), 1);
    assert_eq!(observation.dialogues[0].text(), "second");

    let reject = GatherSettings {
        duplicate_policy: DuplicatePolicy::Reject,
        ..fast_settings(true)
    };
    let observation = gatherer(&provider, reject, collaborators())
        .gather(frame_request("run_1.mp4", frames, false), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!observation.flag);
    assert_eq!(observation.frames.len(), 1);
    assert_eq!(observation.dialogues[0].text(), "first");
}

#[tokio::test]
async fn test_video_source_goes_through_extractor() {
    let fx = Fixture::new();
    let frames = fx.frames(&[0.0, 1.5]);
    let provider = scripted(
        &[("frame-0", "Dialogue:\nmorning"), ("frame-1", "Dialogue:\nnoon")],
        "",
    );
    let request = GatherRequest {
        stages: stages(true, false, false),
        frames: FrameSource::Video(PathBuf::from("recordings/session_12.mp4")),
        ..GatherRequest::default()
    };

    let observation = gatherer(
        &provider,
        fast_settings(false),
        collaborators().with_frame_extractor(Arc::new(FixedExtractor(Ok(frames)))),
    )
    .gather(request.clone(), &CancellationToken::new())
    .await
    .unwrap();
    let keys: Vec<String> = observation.frames.sorted_keys().iter().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["12_0", "12_1.5"]);

    let observation = gatherer(
        &provider,
        fast_settings(false),
        collaborators().with_frame_extractor(Arc::new(FixedExtractor(Err("codec missing".into())))),
    )
    .gather(request.clone(), &CancellationToken::new())
    .await
    .unwrap();
    assert!(observation.frames.is_empty());
    assert!(observation.flag);

    let observation = gatherer(&provider, fast_settings(false), collaborators())
        .gather(request, &CancellationToken::new())
        .await
        .unwrap();
    assert!(observation.frames.is_empty());
}

#[tokio::test]
async fn test_non_recoverable_frame_error_skips_that_frame() {
    let fx = Fixture::new();
    let provider = MockProvider::new().with_responder(|req| match payload(req).as_str() {
        "frame-1" => MockResponse::error("401 Unauthorized"),
        _ => MockResponse::text("Dialogue:\nok"),
    });

    let observation = gatherer(&provider, fast_settings(true), collaborators())
        .gather(
            frame_request("run_1.mp4", fx.frames(&[1.0, 2.0, 3.0]), false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!observation.flag);
    let timestamps: Vec<f64> = observation.frames.sorted_keys().iter().map(|k| k.timestamp).collect();
    assert_eq!(timestamps, vec![1.0, 3.0]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_follows_mode() {
    let fx = Fixture::new();
    let frames = fx.frames(&[1.0, 2.0, 3.0, 4.0]);
    let slow = MockResponse::text("Dialogue:\nslow").with_delay(Duration::from_secs(10));

    for (parallel, expected_peak, expected_elapsed) in [(true, 4, 16), (false, 1, 46)] {
        let provider = MockProvider::new().with_default_response(slow.clone());
        let start = tokio::time::Instant::now();
        let settings = GatherSettings {
            parallel_requests: parallel,
            ..GatherSettings::default()
        };

        gatherer(&provider, settings, collaborators())
            .gather(frame_request("run_1.mp4", frames.clone(), false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.peak_in_flight(), expected_peak);
        assert_eq!(start.elapsed(), Duration::from_secs(expected_elapsed));
    }
}
