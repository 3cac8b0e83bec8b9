use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use mdrunner::engine::progress::{Progress, ProgressCallback};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::warn;

const PHASE_TEMPLATE: &str = "{spinner:.green} {msg}";
const OPEN_RUN_TEMPLATE: &str = "{spinner:.green} {msg} (step {pos}, {per_sec})";
const COUNTED_RUN_TEMPLATE: &str = "{msg:<24} [{bar:40.cyan/blue}] {pos}/{len} steps ({eta})";
const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const EVENT_QUEUE: usize = 1024;

#[derive(Debug)]
pub enum UiEvent {
    Progress(Progress),
    Log(String),
}

/// Phase currently shown on the coordinator's terminal.
struct ActivePhase {
    name: &'static str,
    bar: ProgressBar,
    started: Instant,
}

/// Draws the lifecycle phases and step progress of the coordinating rank on stderr.
pub struct ProgressDisplay {
    multi: MultiProgress,
    phase: Option<ActivePhase>,
    events: mpsc::Receiver<UiEvent>,
    shutdown: watch::Receiver<bool>,
    anchor: ProgressBar,
}

impl ProgressDisplay {
    pub fn new() -> (Self, mpsc::Sender<UiEvent>, watch::Sender<bool>) {
        let (event_sender, events) = mpsc::channel(EVENT_QUEUE);
        let (shutdown_sender, shutdown) = watch::channel(false);
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(12));
        let anchor = multi.add(ProgressBar::hidden());
        let display = Self {
            multi,
            phase: None,
            events,
            shutdown,
            anchor,
        };
        (display, event_sender, shutdown_sender)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.apply(event),
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
        self.clear_phase();
        self.anchor.finish_and_clear();
    }

    fn apply(&mut self, event: UiEvent) {
        match event {
            UiEvent::Log(line) => self.print(line),
            UiEvent::Progress(progress) => self.apply_progress(progress),
        }
    }

    fn apply_progress(&mut self, progress: Progress) {
        match progress {
            Progress::PhaseStart { name } => {
                self.clear_phase();
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(phase_style());
                bar.set_message(name);
                bar.enable_steady_tick(Duration::from_millis(80));
                self.phase = Some(ActivePhase {
                    name,
                    bar,
                    started: Instant::now(),
                });
            }
            Progress::PhaseFinish => {
                if let Some(phase) = self.phase.take() {
                    phase.bar.finish_and_clear();
                    self.print(format!(
                        "✓ {} ({})",
                        phase.name,
                        format_elapsed(phase.started.elapsed())
                    ));
                }
            }
            Progress::TaskStart { total_steps } => {
                if let Some(phase) = &self.phase {
                    phase.bar.reset();
                    if total_steps == 0 {
                        phase.bar.set_style(open_run_style());
                    } else {
                        phase.bar.disable_steady_tick();
                        phase.bar.set_style(counted_run_style());
                        phase.bar.set_length(total_steps);
                    }
                }
            }
            Progress::TaskIncrement { steps } => {
                if let Some(phase) = &self.phase {
                    phase.bar.inc(steps);
                }
            }
            Progress::TaskFinish => {
                if let Some(phase) = &self.phase {
                    phase.bar.finish();
                }
            }
            Progress::Message(text) => self.print(format!("  {}", text)),
        }
    }

    fn clear_phase(&mut self) {
        if let Some(phase) = self.phase.take() {
            phase.bar.finish_and_clear();
        }
    }

    fn print(&self, line: String) {
        self.multi.println(line).ok();
    }
}

fn style_or(template: &str, fallback: fn() -> ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| fallback())
}

fn phase_style() -> ProgressStyle {
    style_or(PHASE_TEMPLATE, ProgressStyle::default_spinner).tick_strings(&SPINNER_FRAMES)
}

fn open_run_style() -> ProgressStyle {
    style_or(OPEN_RUN_TEMPLATE, ProgressStyle::default_spinner).tick_strings(&SPINNER_FRAMES)
}

fn counted_run_style() -> ProgressStyle {
    style_or(COUNTED_RUN_TEMPLATE, ProgressStyle::default_bar)
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = w.write_str(&format_elapsed(state.eta()));
        })
        .progress_chars("━╸ ")
}

/// Wall time in the coarsest unit that still reads well.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1} s", secs)
    } else if secs < 3600.0 {
        format!("{} min {:02} s", (secs / 60.0) as u64, secs as u64 % 60)
    } else {
        format!("{} h {:02} min", (secs / 3600.0) as u64, (secs as u64 / 60) % 60)
    }
}

/// Forwards engine progress into the display queue without blocking the rank threads.
#[derive(Clone)]
pub struct CliProgressHandler {
    sender: mpsc::Sender<UiEvent>,
}

impl CliProgressHandler {
    pub fn new(sender: mpsc::Sender<UiEvent>) -> Self {
        Self { sender }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let sender = self.sender.clone();
        Box::new(move |progress: Progress| {
            if let Err(e) = sender.try_send(UiEvent::Progress(progress)) {
                warn!("Dropped a progress update: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hidden_display() -> (ProgressDisplay, mpsc::Sender<UiEvent>) {
        let (display, sender, _) = ProgressDisplay::new();
        display.multi.set_draw_target(ProgressDrawTarget::hidden());
        (display, sender)
    }

    fn start_phase(display: &mut ProgressDisplay, name: &'static str) {
        display.apply(UiEvent::Progress(Progress::PhaseStart { name }));
    }

    fn active_bar(display: &ProgressDisplay) -> &ProgressBar {
        &display.phase.as_ref().unwrap().bar
    }

    #[test]
    fn every_template_parses() {
        for template in [PHASE_TEMPLATE, OPEN_RUN_TEMPLATE, COUNTED_RUN_TEMPLATE] {
            assert!(
                ProgressStyle::with_template(template).is_ok(),
                "bad template {template}"
            );
        }
    }

    #[test]
    fn elapsed_time_switches_units() {
        assert_eq!(format_elapsed(Duration::from_millis(1300)), "1.3 s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2 min 05 s");
        assert_eq!(format_elapsed(Duration::from_secs(2 * 3600 + 7 * 60)), "2 h 07 min");
    }

    #[test]
    fn a_new_phase_replaces_the_previous_one() {
        let (mut display, _) = hidden_display();
        assert!(display.phase.is_none());

        start_phase(&mut display, "Planning");
        assert_eq!(active_bar(&display).message(), "Planning");

        start_phase(&mut display, "Assigning Duties");
        let phase = display.phase.as_ref().unwrap();
        assert_eq!(phase.name, "Assigning Duties");
        assert_eq!(phase.bar.message(), "Assigning Duties");
    }

    #[test]
    fn finishing_a_phase_clears_it() {
        let (mut display, _) = hidden_display();
        start_phase(&mut display, "Tuning Pair List");

        display.apply(UiEvent::Progress(Progress::PhaseFinish));

        assert!(display.phase.is_none());
        display.apply(UiEvent::Progress(Progress::PhaseFinish));
        assert!(display.phase.is_none());
    }

    #[test]
    fn counted_runs_advance_the_bar() {
        let (mut display, _) = hidden_display();
        start_phase(&mut display, "Running");

        display.apply(UiEvent::Progress(Progress::TaskStart { total_steps: 100 }));
        display.apply(UiEvent::Progress(Progress::TaskIncrement { steps: 10 }));

        assert_eq!(active_bar(&display).length(), Some(100));
        assert_eq!(active_bar(&display).position(), 10);

        display.apply(UiEvent::Progress(Progress::TaskFinish));
        assert!(active_bar(&display).is_finished());
    }

    #[test]
    fn open_ended_runs_count_steps() {
        let (mut display, _) = hidden_display();
        start_phase(&mut display, "Running");

        display.apply(UiEvent::Progress(Progress::TaskStart { total_steps: 0 }));
        for _ in 0..3 {
            display.apply(UiEvent::Progress(Progress::TaskIncrement { steps: 1 }));
        }

        assert_eq!(active_bar(&display).position(), 3);
    }

    #[test]
    fn task_events_without_a_phase_are_ignored() {
        let (mut display, _) = hidden_display();
        display.apply(UiEvent::Progress(Progress::TaskStart { total_steps: 5 }));
        display.apply(UiEvent::Progress(Progress::TaskIncrement { steps: 5 }));
        display.apply(UiEvent::Log("checkpoint written".to_string()));
        display.apply(UiEvent::Progress(Progress::Message("note".to_string())));
        assert!(display.phase.is_none());
    }

    #[tokio::test]
    async fn handler_forwards_engine_progress() {
        let (sender, mut receiver) = mpsc::channel(1);
        let callback = CliProgressHandler::new(sender).get_callback();

        callback(Progress::PhaseStart { name: "Restoring Checkpoint" });

        match receiver.recv().await.unwrap() {
            UiEvent::Progress(Progress::PhaseStart { name }) => {
                assert_eq!(name, "Restoring Checkpoint")
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let (display, sender, shutdown) = ProgressDisplay::new();
        display.multi.set_draw_target(ProgressDrawTarget::hidden());
        sender
            .send(UiEvent::Progress(Progress::PhaseStart { name: "Running" }))
            .await
            .unwrap();
        shutdown.send(true).unwrap();
        display.run().await;
    }
}
