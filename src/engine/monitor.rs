use tokio_util::sync::CancellationToken;

use super::{TurnEngine, TurnState};
use crate::protocol::{ControlMessage, ListenMode};

impl TurnEngine {
    /// Poll the silence counter for one listening cycle. Auto mode ends the
    /// turn once the threshold is reached; realtime mode only reports it.
    pub(super) async fn run_auto_stop_monitor(
        &self,
        token: CancellationToken,
        generation: u64,
        mode: ListenMode,
    ) {
        let Some(audio) = self.inner.audio.clone() else {
            return;
        };
        let threshold = self.inner.config.vad_threshold;
        let mut interval = tokio::time::interval(self.inner.config.vad_poll_interval);
        let mut reported = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Auto-stop monitor cancelled (cycle {})", generation);
                    return;
                }
                _ = interval.tick() => {}
            }

            let silent = audio.silence_counter();
            if silent < threshold {
                reported = false;
                continue;
            }

            if mode == ListenMode::Realtime {
                if !reported {
                    log::info!("🤫 {} silent buffers, realtime mode keeps listening", silent);
                    reported = true;
                }
                continue;
            }

            // Claim the stop under the state lock
            let mut cycle = self.inner.cycle.lock().await;
            if token.is_cancelled()
                || cycle.generation != generation
                || !cycle.state.is_listening()
            {
                return;
            }

            log::info!("🤫 {} silent buffers, stopping auto listening", silent);
            cycle.monitor = None;
            if let Err(e) = audio.stop_capture() {
                log::error!("❌ Auto-stop failed to stop capture: {}", e);
                return;
            }
            cycle.generation += 1;
            self.inner.sink.send(&ControlMessage::ListenStop).await;
            self.set_state(&mut cycle, TurnState::Idle);
            return;
        }
    }
}
