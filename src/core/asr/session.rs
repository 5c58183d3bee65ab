//! Per-utterance session state
//!
//! One `AsrSession` tracks a single utterance from `asr_session_start`
//! to the end of its finalize-wait. The state transitions are driven by
//! the session manager; this module owns the bookkeeping and the small
//! decision helpers so they stay unit-testable.

use crate::core::registry::device::now_ms;
use crate::router::frames::VadState;

use super::transcript::reconcile;

/// What to do with one audio chunk after the VAD bookkeeping ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDecision {
    /// Forward the chunk to the recognition backend.
    pub forward: bool,
    /// Trigger the one-shot early end-of-utterance.
    pub end_early: bool,
}

/// State of one recognition utterance.
#[derive(Debug)]
pub struct AsrSession {
    pub session_id: String,
    pub device_id: String,
    pub sample_rate: u32,
    pub bits: u16,
    pub channels: u16,
    pub session_number: u64,
    pub start_time: u64,
    pub last_chunk_time: u64,
    pub total_chunks: u64,
    pub total_bytes: u64,
    /// Backend utterance opened successfully.
    pub asr_started: bool,
    /// Run length of consecutive `ending` VAD chunks.
    pub ending_chunk_run: u32,
    /// One-shot guard for the early end-of-utterance.
    pub early_end_sent: bool,
    /// Stop requested (early end or explicit stop frame).
    pub stopped: bool,
    /// Finalize-wait already launched; later stop requests are no-ops.
    pub finalize_started: bool,
    /// Reconciled transcript so far.
    pub final_text: Option<String>,
    /// When the transcript last changed (Unix ms).
    pub final_text_set_at: Option<u64>,
    /// A final-flagged update has been reconciled in.
    pub saw_final: bool,
    /// Finalize-wait budget for this session.
    pub max_wait_ms: u64,
}

impl AsrSession {
    pub fn new(
        session_id: String,
        device_id: String,
        sample_rate: u32,
        bits: u16,
        channels: u16,
        session_number: u64,
        max_wait_ms: u64,
    ) -> Self {
        let now = now_ms();
        Self {
            session_id,
            device_id,
            sample_rate,
            bits,
            channels,
            session_number,
            start_time: now,
            last_chunk_time: now,
            total_chunks: 0,
            total_bytes: 0,
            asr_started: false,
            ending_chunk_run: 0,
            early_end_sent: false,
            stopped: false,
            finalize_started: false,
            final_text: None,
            final_text_set_at: None,
            saw_final: false,
            max_wait_ms,
        }
    }

    /// Account one chunk and run the VAD ending-run logic.
    ///
    /// Audio is forwarded only while the voice-activity state is active
    /// or ending and the utterance is still open. After
    /// `ending_run_threshold` consecutive ending chunks the utterance is
    /// ended early, once.
    pub fn observe_chunk(
        &mut self,
        vad_state: VadState,
        byte_len: usize,
        ending_run_threshold: u32,
    ) -> ChunkDecision {
        self.last_chunk_time = now_ms();
        self.total_chunks += 1;
        self.total_bytes += byte_len as u64;

        if self.stopped || self.early_end_sent {
            return ChunkDecision {
                forward: false,
                end_early: false,
            };
        }

        let forward = match vad_state {
            VadState::Active => {
                self.ending_chunk_run = 0;
                true
            }
            VadState::Ending => {
                self.ending_chunk_run += 1;
                true
            }
            VadState::Silent => {
                self.ending_chunk_run = 0;
                false
            }
        };

        let end_early = self.ending_chunk_run >= ending_run_threshold && !self.early_end_sent;
        if end_early {
            self.early_end_sent = true;
        }

        ChunkDecision {
            forward: forward && self.asr_started,
            end_early,
        }
    }

    /// Merge one backend text update into the transcript.
    pub fn apply_update(&mut self, text: &str, is_final: bool) {
        let merged = reconcile(self.final_text.as_deref(), text);
        self.final_text = Some(merged);
        self.final_text_set_at = Some(now_ms());
        if is_final {
            self.saw_final = true;
        }
    }

    /// Whether the finalize-wait can complete successfully.
    pub fn finalized(&self) -> bool {
        self.saw_final && self.final_text.is_some()
    }

    /// Age of the last chunk, for the abandoned-session sweep.
    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_chunk_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AsrSession {
        let mut s = AsrSession::new(
            "sess-1".into(),
            "esp32-1".into(),
            16_000,
            16,
            1,
            1,
            3_000,
        );
        s.asr_started = true;
        s
    }

    #[test]
    fn test_active_chunks_forward_and_reset_run() {
        let mut s = session();
        assert!(s.observe_chunk(VadState::Ending, 320, 2).forward);
        assert_eq!(s.ending_chunk_run, 1);
        let decision = s.observe_chunk(VadState::Active, 320, 2);
        assert!(decision.forward);
        assert!(!decision.end_early);
        assert_eq!(s.ending_chunk_run, 0);
    }

    #[test]
    fn test_two_ending_chunks_trigger_early_end_once() {
        let mut s = session();
        assert!(!s.observe_chunk(VadState::Ending, 320, 2).end_early);
        let second = s.observe_chunk(VadState::Ending, 320, 2);
        assert!(second.end_early);
        assert!(s.early_end_sent);
        // Further chunks neither forward nor re-trigger.
        let third = s.observe_chunk(VadState::Ending, 320, 2);
        assert!(!third.end_early);
        assert!(!third.forward);
    }

    #[test]
    fn test_silent_chunks_do_not_forward() {
        let mut s = session();
        let decision = s.observe_chunk(VadState::Silent, 320, 2);
        assert!(!decision.forward);
        assert_eq!(s.total_chunks, 1);
        assert_eq!(s.total_bytes, 320);
    }

    #[test]
    fn test_unstarted_backend_blocks_forwarding() {
        let mut s = session();
        s.asr_started = false;
        assert!(!s.observe_chunk(VadState::Active, 320, 2).forward);
    }

    #[test]
    fn test_updates_reconcile_into_transcript() {
        let mut s = session();
        s.apply_update("he", false);
        s.apply_update("hello", false);
        s.apply_update("hell", true);
        assert_eq!(s.final_text.as_deref(), Some("hello"));
        assert!(s.finalized());
    }

    #[test]
    fn test_not_finalized_without_final_update() {
        let mut s = session();
        s.apply_update("hello", false);
        assert!(!s.finalized());
    }
}
