use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use shared::domain::{DeliveryState, ImageFormat, LocalMessageId, RoomId, SendMode, UserId};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

pub mod animation;
pub mod format;
pub mod preview;
pub mod queue;

use preview::{PreviewHandle, PreviewRegistry};
pub use queue::{DispatchQueue, RetryError};

/// Hard cap on how many files a single selection operation may stage.
pub const MAX_BATCH: usize = 10;
const IMAGE_MIME_FILTER: &str = "image/*";

/// A raw file handed over by the file-selection collaborator.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Read-only snapshot of the conversation context at staging time. Values
/// are captured once per batch and never re-fetched.
#[derive(Debug, Clone)]
pub struct StagingContext {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_avatar: String,
}

#[async_trait]
pub trait FilePicker: Send + Sync {
    /// Opens the platform file selector and yields the chosen files as a
    /// stream. `mime_filter` is a pattern such as `"image/*"`.
    async fn pick_files(
        &self,
        mime_filter: &str,
        multiple: bool,
    ) -> Result<BoxStream<'static, SelectedFile>>;
}

pub struct MissingFilePicker;

#[async_trait]
impl FilePicker for MissingFilePicker {
    async fn pick_files(
        &self,
        _mime_filter: &str,
        _multiple: bool,
    ) -> Result<BoxStream<'static, SelectedFile>> {
        Err(anyhow!("file picker is unavailable"))
    }
}

#[async_trait]
pub trait BatchPrompt: Send + Sync {
    /// Presents the original-vs-optimized choice for a whole batch,
    /// reminding the user of the `max_batch` cap. Dismissing the prompt is
    /// not an abort: it resolves to [`SendMode::Optimized`].
    async fn choose_send_mode(&self, max_batch: usize) -> SendMode;
}

/// Prompt stand-in that always picks the optimized path, matching the
/// behavior of a dismissed prompt.
pub struct AutoOptimizePrompt;

#[async_trait]
impl BatchPrompt for AutoOptimizePrompt {
    async fn choose_send_mode(&self, _max_batch: usize) -> SendMode {
        SendMode::Optimized
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Delivers one staged message. Resolves exactly once per call; an
    /// `Err` marks the message as failed without stalling the queue.
    async fn send(&self, message: &PendingImageMessage) -> Result<()>;
}

pub struct MissingTransport;

#[async_trait]
impl MessageTransport for MissingTransport {
    async fn send(&self, message: &PendingImageMessage) -> Result<()> {
        Err(anyhow!(
            "message transport is unavailable for room {}",
            message.room_id().0
        ))
    }
}

#[async_trait]
pub trait TranscriptSink: Send + Sync {
    /// Appends a staged message to the visible transcript. The sink keeps
    /// the same `Arc` the queue mutates, so later state transitions show
    /// up in place.
    async fn append(&self, message: Arc<PendingImageMessage>);
    async fn scroll_to_latest(&self);
}

pub struct NullTranscriptSink;

#[async_trait]
impl TranscriptSink for NullTranscriptSink {
    async fn append(&self, _message: Arc<PendingImageMessage>) {}
    async fn scroll_to_latest(&self) {}
}

pub trait ContextProvider: Send + Sync {
    fn staging_context(&self) -> StagingContext;
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    MessageStaged {
        id: LocalMessageId,
        room_id: RoomId,
    },
    DeliveryStateChanged {
        id: LocalMessageId,
        room_id: RoomId,
        state: DeliveryState,
    },
    BatchTruncated {
        selected: usize,
        accepted: usize,
    },
}

/// A staged outbound image message: visible in the transcript before any
/// network confirmation exists. The transcript sink and the dispatch queue
/// share one allocation; only the dispatch queue writes the delivery
/// state.
pub struct PendingImageMessage {
    id: LocalMessageId,
    room_id: RoomId,
    sender_id: UserId,
    sender_avatar: String,
    filename: String,
    mime_type: Option<String>,
    raw_content: Vec<u8>,
    preview: PreviewHandle,
    use_original: bool,
    format: ImageFormat,
    staged_at: DateTime<Utc>,
    state: RwLock<DeliveryState>,
}

impl PendingImageMessage {
    pub(crate) fn stage(
        file: SelectedFile,
        use_original: bool,
        format: ImageFormat,
        context: &StagingContext,
        previews: &PreviewRegistry,
    ) -> Arc<Self> {
        let id = LocalMessageId::random();
        let preview = previews.allocate();
        debug!(
            message_id = %id,
            room_id = context.room_id.0,
            filename = %file.filename,
            use_original,
            "staged pending image message"
        );
        Arc::new(Self {
            id,
            room_id: context.room_id,
            sender_id: context.sender_id,
            sender_avatar: context.sender_avatar.clone(),
            filename: file.filename,
            mime_type: file.mime_type,
            raw_content: file.bytes,
            preview,
            use_original,
            format,
            staged_at: Utc::now(),
            state: RwLock::new(DeliveryState::Pending),
        })
    }

    pub fn id(&self) -> LocalMessageId {
        self.id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn sender_id(&self) -> UserId {
        self.sender_id
    }

    pub fn sender_avatar(&self) -> &str {
        &self.sender_avatar
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// The original file payload. Owned by this entity; the transport
    /// borrows it for the duration of a send.
    pub fn raw_content(&self) -> &[u8] {
        &self.raw_content
    }

    /// Display-safe local reference for rendering the image before the
    /// upload completes. Never a network URL.
    pub fn preview_uri(&self) -> &str {
        self.preview.uri()
    }

    pub fn use_original(&self) -> bool {
        self.use_original
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn staged_at(&self) -> DateTime<Utc> {
        self.staged_at
    }

    pub async fn state(&self) -> DeliveryState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: DeliveryState) {
        *self.state.write().await = state;
    }
}

/// What a single selection operation produced.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub mode: SendMode,
    pub staged: Vec<LocalMessageId>,
    /// Files beyond [`MAX_BATCH`] that were never staged.
    pub dropped: usize,
}

/// Orchestrates the outbound image pipeline: selection, batch gatekeeping,
/// staging, optimistic transcript append, and the per-room dispatch drain.
pub struct MediaComposer {
    picker: Arc<dyn FilePicker>,
    prompt: Arc<dyn BatchPrompt>,
    context: Arc<dyn ContextProvider>,
    sink: Arc<dyn TranscriptSink>,
    queue: Arc<DispatchQueue>,
    previews: PreviewRegistry,
    format: ImageFormat,
    events: broadcast::Sender<PipelineEvent>,
}

impl MediaComposer {
    pub fn new(
        picker: Arc<dyn FilePicker>,
        prompt: Arc<dyn BatchPrompt>,
        context: Arc<dyn ContextProvider>,
        sink: Arc<dyn TranscriptSink>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        Self::new_with_format(
            format::resolve_format(),
            picker,
            prompt,
            context,
            sink,
            transport,
        )
    }

    pub fn new_with_format(
        format: ImageFormat,
        picker: Arc<dyn FilePicker>,
        prompt: Arc<dyn BatchPrompt>,
        context: Arc<dyn ContextProvider>,
        sink: Arc<dyn TranscriptSink>,
        transport: Arc<dyn MessageTransport>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let queue = DispatchQueue::new(transport, events.clone());
        Arc::new(Self {
            picker,
            prompt,
            context,
            sink,
            queue,
            previews: PreviewRegistry::default(),
            format,
            events,
        })
    }

    pub fn negotiated_format(&self) -> ImageFormat {
        self.format
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Runs one selection operation end to end: pick files, clamp the batch
    /// to [`MAX_BATCH`], ask for the batch send mode, stage every accepted
    /// file into the transcript and the dispatch queue in selection order,
    /// then trigger a single drain pass for the room.
    pub async fn select_images(&self) -> Result<BatchOutcome> {
        let mut stream = self.picker.pick_files(IMAGE_MIME_FILTER, true).await?;

        let mut files = Vec::new();
        let mut dropped = 0usize;
        while let Some(file) = stream.next().await {
            if files.len() < MAX_BATCH {
                files.push(file);
            } else {
                dropped += 1;
            }
        }

        if files.is_empty() {
            debug!("image selection yielded no files");
            return Ok(BatchOutcome {
                mode: SendMode::Optimized,
                staged: Vec::new(),
                dropped: 0,
            });
        }

        if dropped > 0 {
            warn!(
                selected = files.len() + dropped,
                accepted = files.len(),
                "image batch truncated to cap"
            );
            let _ = self.events.send(PipelineEvent::BatchTruncated {
                selected: files.len() + dropped,
                accepted: files.len(),
            });
        }

        let mode = self.prompt.choose_send_mode(MAX_BATCH).await;
        let context = self.context.staging_context();

        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let animated = match animation::is_animated(&file.bytes) {
                Ok(animated) => animated,
                Err(err) => {
                    warn!(
                        filename = %file.filename,
                        error = %err,
                        "animation probe failed; treating file as static"
                    );
                    false
                }
            };
            let use_original = mode.use_original() || animated;

            let message = PendingImageMessage::stage(
                file,
                use_original,
                self.format,
                &context,
                &self.previews,
            );
            self.sink.append(Arc::clone(&message)).await;
            self.sink.scroll_to_latest().await;
            self.queue.enqueue(Arc::clone(&message)).await;
            let _ = self.events.send(PipelineEvent::MessageStaged {
                id: message.id(),
                room_id: context.room_id,
            });
            staged.push(message.id());
        }

        info!(
            room_id = context.room_id.0,
            staged = staged.len(),
            dropped,
            mode = ?mode,
            "staged image batch"
        );
        self.queue.drain(context.room_id).await;

        Ok(BatchOutcome {
            mode,
            staged,
            dropped,
        })
    }

    /// Re-enqueues a message that ended in `Failed` and kicks its room's
    /// drain. Messages in any other state cannot be retried.
    pub async fn retry(&self, id: LocalMessageId) -> Result<(), RetryError> {
        self.queue.retry(id).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
