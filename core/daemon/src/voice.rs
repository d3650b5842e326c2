//! Serial voice playback for lifecycle announcements.
//!
//! Overlapping audio is unintelligible, so playback is a single-consumer
//! FIFO: a bounded queue of cached clips drained one at a time by an
//! external player process. Depth and age caps keep a burst from turning
//! into a backlog of stale announcements, and a wall-clock cap keeps a
//! stuck player from stalling the queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_PLAY: Duration = Duration::from_millis(15_000);

#[cfg(target_os = "macos")]
const DEFAULT_PLAYER: &[&str] = &["afplay"];
#[cfg(not(target_os = "macos"))]
const DEFAULT_PLAYER: &[&str] = &["aplay", "-q"];

/// One pending announcement. `enqueued_at` exists only for age eviction.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub file_path: PathBuf,
    pub label: String,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Player command; the clip path is appended as the final argument.
    pub player: Vec<String>,
    pub max_depth: usize,
    pub max_age: Duration,
    pub max_play: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player: DEFAULT_PLAYER.iter().map(|s| s.to_string()).collect(),
            max_depth: DEFAULT_MAX_DEPTH,
            max_age: DEFAULT_MAX_AGE,
            max_play: DEFAULT_MAX_PLAY,
        }
    }
}

#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: PlaybackConfig,
    pending: Mutex<VecDeque<QueueItem>>,
    playing: AtomicBool,
    stopped: AtomicBool,
    interrupt: Notify,
}

impl PlaybackQueue {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(VecDeque::new()),
                playing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                interrupt: Notify::new(),
            }),
        }
    }

    /// Append an item, or drop it silently when the queue is full. Voice
    /// is non-critical, so back-pressure sheds new work rather than grow.
    pub fn enqueue(&self, item: QueueItem) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut pending = lock_pending(&self.inner);
            if pending.len() >= self.inner.config.max_depth {
                debug!(label = %item.label, depth = pending.len(), "Voice queue full; dropping item");
                return;
            }
            pending.push_back(item);
        }

        if !self.inner.playing.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain(inner));
        }
    }

    /// Clear pending items and kill the in-flight player. Used during
    /// graceful shutdown; the queue accepts nothing afterwards.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        lock_pending(&self.inner).clear();
        self.inner.interrupt.notify_waiters();
    }

    /// Clear pending items without interrupting current playback.
    pub fn clear(&self) {
        lock_pending(&self.inner).clear();
    }

    pub fn depth(&self) -> usize {
        lock_pending(&self.inner).len()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::SeqCst)
    }
}

fn lock_pending(inner: &Inner) -> std::sync::MutexGuard<'_, VecDeque<QueueItem>> {
    match inner.pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Single-consumer drain loop. `playing` goes false on every exit path.
async fn drain(inner: Arc<Inner>) {
    loop {
        while let Some(item) = pop_front(&inner) {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            if item.enqueued_at.elapsed() > inner.config.max_age {
                debug!(label = %item.label, "Skipping stale voice item");
                continue;
            }
            play(&inner, &item).await;
        }

        inner.playing.store(false, Ordering::SeqCst);

        // An enqueue may have landed between the last pop and the flag
        // reset; take the consumer role back if nobody else has.
        if inner.stopped.load(Ordering::SeqCst) || lock_pending(&inner).is_empty() {
            return;
        }
        if inner.playing.swap(true, Ordering::SeqCst) {
            return;
        }
    }
}

fn pop_front(inner: &Inner) -> Option<QueueItem> {
    lock_pending(inner).pop_front()
}

async fn play(inner: &Inner, item: &QueueItem) {
    let (program, args) = match inner.config.player.split_first() {
        Some(split) => split,
        None => return,
    };

    let mut child = match Command::new(program)
        .args(args)
        .arg(&item.file_path)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(error = %err, player = %program, "Failed to spawn audio player");
            return;
        }
    };

    tokio::select! {
        status = child.wait() => {
            if let Err(err) = status {
                warn!(error = %err, label = %item.label, "Audio player wait failed");
            }
        }
        _ = tokio::time::sleep(inner.config.max_play) => {
            warn!(label = %item.label, "Audio playback exceeded deadline; killing player");
            let _ = child.kill().await;
        }
        _ = inner.interrupt.notified() => {
            let _ = child.kill().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Clip resolution
// ---------------------------------------------------------------------------

/// Built-in agent catalog: display label plus the phrase each cached clip
/// speaks. Clips are generated offline; the daemon only resolves them.
const AGENT_CATALOG: &[AgentVoice] = &[
    AgentVoice::new("orchestrator", "Orchestrator"),
    AgentVoice::new("planner", "Planner"),
    AgentVoice::new("coder", "Coder"),
    AgentVoice::new("reviewer", "Reviewer"),
    AgentVoice::new("tester", "Tester"),
];

struct AgentVoice {
    agent_type: &'static str,
    label: &'static str,
}

impl AgentVoice {
    const fn new(agent_type: &'static str, label: &'static str) -> Self {
        Self { agent_type, label }
    }

    fn text(&self, phase: Phase) -> String {
        match phase {
            Phase::Start => format!("{} starting", self.label),
            Phase::Stop => format!("{} finished", self.label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Stop,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Stop => "stop",
        }
    }
}

/// Result of a notify request, mirrored directly into the HTTP response.
#[derive(Debug)]
pub enum NotifyOutcome {
    Queued { label: String, text: String },
    Rejected { reason: &'static str },
}

/// Voice surface exposed to the server: catalog lookup, clip resolution,
/// and queue observers for `/health`.
pub struct VoiceService {
    queue: PlaybackQueue,
    enabled: bool,
    clips_dir: PathBuf,
}

impl VoiceService {
    pub fn new(enabled: bool, clips_dir: PathBuf, config: PlaybackConfig) -> Self {
        Self {
            queue: PlaybackQueue::new(config),
            enabled,
            clips_dir,
        }
    }

    pub fn notify(&self, agent_type: &str, phase: Phase) -> NotifyOutcome {
        if !self.enabled {
            return NotifyOutcome::Rejected {
                reason: "voice_disabled",
            };
        }

        let voice = match AGENT_CATALOG
            .iter()
            .find(|entry| entry.agent_type == agent_type)
        {
            Some(voice) => voice,
            None => {
                return NotifyOutcome::Rejected {
                    reason: "unknown_agent",
                }
            }
        };

        let clip = self
            .clips_dir
            .join(format!("{}-{}.wav", voice.agent_type, phase.as_str()));
        if !clip.is_file() {
            return NotifyOutcome::Rejected {
                reason: "not_cached",
            };
        }

        let label = voice.label.to_string();
        let text = voice.text(phase);
        self.queue.enqueue(QueueItem {
            file_path: clip,
            label: label.clone(),
            enqueued_at: Instant::now(),
        });

        NotifyOutcome::Queued { label, text }
    }

    pub fn mode(&self) -> &'static str {
        if self.enabled {
            "cached"
        } else {
            "disabled"
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn is_playing(&self) -> bool {
        self.queue.is_playing()
    }

    pub fn stop(&self) {
        self.queue.stop();
    }
}
