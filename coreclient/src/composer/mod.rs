// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Composition state machine.
//!
//! Owns the draft text, the debounced typing-active transitions, character
//! limit enforcement and draft autosave. Typing notifications are emitted on
//! `idle <-> typing` transitions only, never per keystroke; drafts are saved
//! after a quiet delay and cleared immediately when the text becomes empty.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use terncommon::identifiers::ChatId;
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod draft;

pub use draft::{Draft, DraftStore, DraftStoreError, MemoryDraftStore, SqliteDraftStore};

/// Where the committed text sits relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LimitState {
    #[default]
    Normal,
    Warning,
    SoftError,
    HardError,
}

/// Observable composer state.
///
/// `character_count` always reflects the committed text, even when input was
/// rejected for exceeding the hard limit.
#[derive(Debug, Clone, Default)]
pub struct ComposerState {
    pub text: String,
    pub is_typing: bool,
    pub character_count: usize,
    pub limit: LimitState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterLimits {
    pub warning: usize,
    pub soft: usize,
    pub hard: usize,
}

impl Default for CharacterLimits {
    fn default() -> Self {
        Self {
            warning: 1800,
            soft: 1900,
            hard: 2000,
        }
    }
}

impl CharacterLimits {
    fn classify(&self, count: usize) -> LimitState {
        if count >= self.hard {
            LimitState::HardError
        } else if count > self.soft {
            LimitState::SoftError
        } else if count > self.warning {
            LimitState::Warning
        } else {
            LimitState::Normal
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerConfig {
    pub limits: CharacterLimits,
    /// Quiet interval after which typing reverts to idle.
    pub typing_quiet_interval: Duration,
    /// Debounce delay for draft autosave.
    pub autosave_delay: Duration,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            limits: CharacterLimits::default(),
            typing_quiet_interval: Duration::from_secs(3),
            autosave_delay: Duration::from_millis(800),
        }
    }
}

enum ComposerEvent {
    Input { text: String },
    Cleared,
}

/// Composition state machine for one chat.
///
/// Constructed without a draft store, autosave and restore are disabled;
/// everything else behaves identically.
pub struct Composer<D: DraftStore> {
    config: ComposerConfig,
    state_tx: watch::Sender<ComposerState>,
    typing_tx: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<ComposerEvent>,
    drafts: Option<Arc<D>>,
    cancel: CancellationToken,
}

impl<D: DraftStore> Composer<D> {
    pub async fn new(chat_id: ChatId, config: ComposerConfig, drafts: Option<D>) -> Self {
        let drafts = drafts.map(Arc::new);

        let mut initial = ComposerState::default();
        if let Some(store) = &drafts {
            match store.load(chat_id).await {
                Ok(Some(draft)) => {
                    debug!(%chat_id, "restored persisted draft");
                    initial.character_count = draft.message.chars().count();
                    initial.limit = config.limits.classify(initial.character_count);
                    initial.text = draft.message;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(%chat_id, %error, "failed to restore draft");
                }
            }
        }

        let (state_tx, _) = watch::channel(initial);
        let (typing_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(timer_loop(
            chat_id,
            config.clone(),
            drafts.clone(),
            state_tx.clone(),
            typing_tx.clone(),
            events_rx,
            cancel.clone(),
        ));

        Self {
            config,
            state_tx,
            typing_tx,
            events_tx,
            drafts,
            cancel,
        }
    }

    pub fn state(&self) -> ComposerState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ComposerState> {
        self.state_tx.subscribe()
    }

    /// Outbound typing notification stream; `true` on idle->typing, `false`
    /// after the quiet interval.
    pub fn subscribe_typing(&self) -> watch::Receiver<bool> {
        self.typing_tx.subscribe()
    }

    pub fn autosave_enabled(&self) -> bool {
        self.drafts.is_some()
    }

    /// Commits an edited text.
    ///
    /// Insertions that would grow the text past the hard limit are clamped at
    /// the limit; deletions are always accepted. Returns the committed text
    /// length in characters.
    pub fn apply_input(&self, proposed: &str) -> usize {
        let hard = self.config.limits.hard;
        let proposed_count = proposed.chars().count();

        let mut committed_count = proposed_count;
        self.state_tx.send_modify(|state| {
            // Even a rejected insertion is typing activity.
            if !state.is_typing {
                state.is_typing = true;
                self.typing_tx.send_replace(true);
                debug!("typing started");
            }
            let current_count = state.character_count;
            let growing = proposed_count > current_count;
            if growing && current_count >= hard {
                // Already at (or restored beyond) the limit: reject the
                // insertion outright, keep the committed text.
                committed_count = current_count;
                return;
            }
            let text = if growing && proposed_count > hard {
                committed_count = hard;
                truncate_chars(proposed, hard)
            } else {
                proposed.to_owned()
            };
            state.character_count = committed_count;
            state.limit = self.config.limits.classify(committed_count);
            state.text = text;
        });

        let text = self.state_tx.borrow().text.clone();
        let _ = self.events_tx.send(ComposerEvent::Input { text });
        committed_count
    }

    /// Takes the committed text for submission, clearing the draft.
    ///
    /// Returns `None` when there is nothing to submit.
    pub fn take_submission(&self) -> Option<String> {
        let mut taken = None;
        self.state_tx.send_modify(|state| {
            if !state.text.is_empty() {
                taken = Some(std::mem::take(&mut state.text));
            }
            state.character_count = 0;
            state.limit = LimitState::Normal;
            self.stop_typing(state);
        });
        let _ = self.events_tx.send(ComposerEvent::Cleared);
        taken
    }

    /// Discards the composed text and the persisted draft.
    pub fn discard_draft(&self) {
        self.state_tx.send_modify(|state| {
            state.text.clear();
            state.character_count = 0;
            state.limit = LimitState::Normal;
            self.stop_typing(state);
        });
        let _ = self.events_tx.send(ComposerEvent::Cleared);
    }

    /// Submitting or discarding ends the typing session immediately instead
    /// of waiting out the quiet interval.
    fn stop_typing(&self, state: &mut ComposerState) {
        if state.is_typing {
            state.is_typing = false;
            self.typing_tx.send_replace(false);
            debug!("typing stopped");
        }
    }
}

impl<D: DraftStore> Drop for Composer<D> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((boundary, _)) => text[..boundary].to_owned(),
        None => text.to_owned(),
    }
}

/// Background loop owning the typing-idle and autosave deadlines.
///
/// All draft store I/O happens here, so the composer's edit path stays
/// synchronous and non-blocking.
async fn timer_loop<D: DraftStore>(
    chat_id: ChatId,
    config: ComposerConfig,
    drafts: Option<Arc<D>>,
    state_tx: watch::Sender<ComposerState>,
    typing_tx: watch::Sender<bool>,
    mut events: mpsc::UnboundedReceiver<ComposerEvent>,
    cancel: CancellationToken,
) {
    let mut typing_deadline: Option<Instant> = None;
    let mut autosave_deadline: Option<Instant> = None;
    let mut pending_draft: Option<String> = None;

    loop {
        let next_deadline = [typing_deadline, autosave_deadline]
            .into_iter()
            .flatten()
            .min();

        tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                match event {
                    ComposerEvent::Input { text } => {
                        typing_deadline = Some(Instant::now() + config.typing_quiet_interval);
                        if text.is_empty() {
                            autosave_deadline = None;
                            pending_draft = None;
                            clear_draft(&drafts, chat_id).await;
                        } else {
                            pending_draft = Some(text);
                            autosave_deadline = Some(Instant::now() + config.autosave_delay);
                        }
                    }
                    ComposerEvent::Cleared => {
                        // Typing already ended on the edit path; drop the
                        // stale deadline so it cannot fire later.
                        typing_deadline = None;
                        autosave_deadline = None;
                        pending_draft = None;
                        clear_draft(&drafts, chat_id).await;
                    }
                }
            }
            _ = async {
                match next_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                let now = Instant::now();
                if typing_deadline.is_some_and(|deadline| deadline <= now) {
                    typing_deadline = None;
                    state_tx.send_modify(|state| state.is_typing = false);
                    typing_tx.send_replace(false);
                    debug!("typing stopped");
                }
                if autosave_deadline.is_some_and(|deadline| deadline <= now) {
                    autosave_deadline = None;
                    if let Some(message) = pending_draft.take() {
                        save_draft(&drafts, chat_id, message).await;
                    }
                }
            }
        }
    }
}

async fn save_draft<D: DraftStore>(drafts: &Option<Arc<D>>, chat_id: ChatId, message: String) {
    let Some(store) = drafts else { return };
    let draft = Draft {
        message,
        updated_at: Utc::now(),
    };
    if let Err(error) = store.save(chat_id, &draft).await {
        warn!(%chat_id, %error, "draft autosave unavailable");
    }
}

async fn clear_draft<D: DraftStore>(drafts: &Option<Arc<D>>, chat_id: ChatId) {
    let Some(store) = drafts else { return };
    if let Err(error) = store.clear(chat_id).await {
        warn!(%chat_id, %error, "failed to clear draft");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> ComposerConfig {
        ComposerConfig {
            limits: CharacterLimits {
                warning: 10,
                soft: 15,
                hard: 20,
            },
            typing_quiet_interval: Duration::from_secs(3),
            autosave_delay: Duration::from_millis(800),
        }
    }

    async fn settle() {
        // Lets the timer loop observe pending events under paused time.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn typing_notifications_are_debounced() {
        let composer: Composer<MemoryDraftStore> =
            Composer::new(ChatId::random(), config(), None).await;
        let typing = composer.subscribe_typing();
        assert!(!*typing.borrow());

        composer.apply_input("h");
        assert!(*typing.borrow());
        assert!(composer.state().is_typing);

        // More keystrokes within the quiet interval extend it without
        // emitting again.
        tokio::time::sleep(Duration::from_secs(2)).await;
        composer.apply_input("he");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(*typing.borrow());

        // Quiet interval elapses.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!*typing.borrow());
        assert!(!composer.state().is_typing);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_limit_clamps_insertions_but_allows_deletions() {
        let composer: Composer<MemoryDraftStore> =
            Composer::new(ChatId::random(), config(), None).await;

        let committed = composer.apply_input(&"x".repeat(25));
        assert_eq!(committed, 20);
        let state = composer.state();
        assert_eq!(state.text.len(), 20);
        assert_eq!(state.character_count, 20);
        assert_eq!(state.limit, LimitState::HardError);

        // Further insertion is rejected; the committed text is unchanged.
        let committed = composer.apply_input(&"x".repeat(21));
        assert_eq!(committed, 20);
        assert_eq!(composer.state().text.len(), 20);

        // Backspacing is still accepted.
        let committed = composer.apply_input(&"x".repeat(19));
        assert_eq!(committed, 19);
        let state = composer.state();
        assert_eq!(state.character_count, 19);
        assert_eq!(state.limit, LimitState::SoftError);

        let committed = composer.apply_input(&"x".repeat(11));
        assert_eq!(committed, 11);
        assert_eq!(composer.state().limit, LimitState::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn clamping_respects_char_boundaries() {
        let composer: Composer<MemoryDraftStore> =
            Composer::new(ChatId::random(), config(), None).await;
        // 25 multi-byte characters.
        let committed = composer.apply_input(&"ä".repeat(25));
        assert_eq!(committed, 20);
        assert_eq!(composer.state().text.chars().count(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn draft_is_autosaved_after_the_debounce_delay() {
        let store = Arc::new(MemoryDraftStore::new());
        let chat_id = ChatId::random();
        let composer = Composer::new(chat_id, config(), Some(store.clone())).await;
        assert!(composer.autosave_enabled());

        composer.apply_input("hello");
        settle().await;
        assert!(store.load(chat_id).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let draft = store.load(chat_id).await.unwrap().unwrap();
        assert_eq!(draft.message, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_clears_the_draft_immediately() {
        let store = Arc::new(MemoryDraftStore::new());
        let chat_id = ChatId::random();
        let composer = Composer::new(chat_id, config(), Some(store.clone())).await;

        composer.apply_input("hello");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.load(chat_id).await.unwrap().is_some());

        composer.apply_input("");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.load(chat_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn take_submission_clears_text_and_draft() {
        let store = Arc::new(MemoryDraftStore::new());
        let chat_id = ChatId::random();
        let composer = Composer::new(chat_id, config(), Some(store.clone())).await;

        composer.apply_input("ready to send");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.load(chat_id).await.unwrap().is_some());

        assert_eq!(
            composer.take_submission().as_deref(),
            Some("ready to send")
        );
        let state = composer.state();
        assert!(state.text.is_empty());
        assert_eq!(state.character_count, 0);
        assert_eq!(state.limit, LimitState::Normal);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.load(chat_id).await.unwrap().is_none());

        // Nothing left to submit.
        assert_eq!(composer.take_submission(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_resets_typing_to_idle() {
        let composer: Composer<MemoryDraftStore> =
            Composer::new(ChatId::random(), config(), None).await;
        let typing = composer.subscribe_typing();

        composer.apply_input("on my way");
        assert!(*typing.borrow());

        // Sending ends the typing session immediately, not after the quiet
        // interval.
        assert!(composer.take_submission().is_some());
        assert!(!*typing.borrow());
        assert!(!composer.state().is_typing);

        // The next keystroke is a fresh idle->typing transition.
        composer.apply_input("p");
        assert!(*typing.borrow());

        // Discarding ends it as well.
        composer.discard_draft();
        assert!(!*typing.borrow());
        assert!(!composer.state().is_typing);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_draft_is_restored_on_construction() {
        let store = Arc::new(MemoryDraftStore::new());
        let chat_id = ChatId::random();
        store
            .save(
                chat_id,
                &Draft {
                    message: "picked up again".to_owned(),
                    updated_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let composer = Composer::new(chat_id, config(), Some(store.clone())).await;
        let state = composer.state();
        assert_eq!(state.text, "picked up again");
        assert_eq!(state.character_count, 15);
        assert_eq!(state.limit, LimitState::Warning);
        assert!(!state.is_typing);
    }
}
