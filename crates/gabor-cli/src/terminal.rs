use anyhow::Result;
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use gabor_runner::trial::rb_label;
use gabor_runner::{CancelToken, Feedback, InputArbiter, StimulusDisplay, TracingDisplay};
use std::io::{stdout, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const KEY_POLL: Duration = Duration::from_millis(25);

fn key_name(code: KeyCode) -> Option<String> {
    match code {
        KeyCode::Esc => Some("Escape".to_string()),
        KeyCode::Enter => Some("Enter".to_string()),
        KeyCode::Left => Some("ArrowLeft".to_string()),
        KeyCode::Right => Some("ArrowRight".to_string()),
        KeyCode::Char(' ') => Some("Space".to_string()),
        KeyCode::Char(c) => Some(c.to_string()),
        _ => None,
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Reads key presses on a background thread and feeds them to the arbiter.
///
/// Holds the terminal in raw mode until stopped. Ctrl-C counts as abort.
pub struct KeyboardReader {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
    _raw: RawModeGuard,
}

impl KeyboardReader {
    pub fn start(arbiter: Arc<InputArbiter>) -> Result<Self> {
        let raw = RawModeGuard::enable()?;
        let stop = CancelToken::new();
        let signal = stop.clone();
        let handle = thread::spawn(move || {
            while !signal.is_cancelled() {
                match event::poll(KEY_POLL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(err) => {
                        warn!(error = %err, "keyboard poll failed; keyboard input disabled");
                        break;
                    }
                }
                let key = match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(error = %err, "keyboard read failed; keyboard input disabled");
                        break;
                    }
                };
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
                {
                    arbiter.handle_abort();
                    continue;
                }
                if let Some(name) = key_name(key.code) {
                    let disposition = arbiter.on_key(&name);
                    debug!(key = %name, ?disposition, "key");
                }
            }
        });
        Ok(Self {
            stop,
            handle: Some(handle),
            _raw: raw,
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeyboardReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Text rendering of each phase on the controlling terminal.
#[derive(Default)]
pub struct TerminalDisplay {
    shown: usize,
    alternate: bool,
}

impl TerminalDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    fn draw(&self, lines: &[String]) {
        let mut out = stdout();
        let mut text = String::new();
        for line in lines {
            text.push_str(line);
            text.push_str("\r\n");
        }
        let drawn = execute!(out, Clear(ClearType::All), MoveTo(0, 0), Print(text));
        if let Err(err) = drawn.and_then(|_| out.flush()) {
            debug!(error = %err, "terminal draw failed");
        }
    }
}

impl Drop for TerminalDisplay {
    fn drop(&mut self) {
        if self.alternate {
            let _ = execute!(stdout(), Show, LeaveAlternateScreen);
        }
    }
}

impl StimulusDisplay for TerminalDisplay {
    fn request_fullscreen(&mut self) -> bool {
        if !self.alternate {
            self.alternate = execute!(stdout(), EnterAlternateScreen, Hide).is_ok();
        }
        self.alternate
    }

    fn fixation(&mut self) {
        self.draw(&["".to_string(), "        +".to_string()]);
    }

    fn blank(&mut self) {
        self.draw(&[]);
    }

    fn stimulus(&mut self, orientation: f64, stripes: u32) {
        self.shown += 1;
        self.draw(&[
            format!("trial {}", self.shown),
            format!("orientation {:+.1} deg   stripes {}", orientation, stripes),
            String::new(),
            "press A or B (Esc aborts)".to_string(),
        ]);
    }

    fn feedback(&mut self, feedback: Feedback) {
        self.draw(&[String::new(), format!("        {}", feedback.text())]);
    }
}

/// Scripted observer answering every stimulus by the orientation rule after
/// a fixed delay. Used for unattended dry runs.
pub struct RuleObserver {
    inner: TracingDisplay,
    arbiter: Arc<InputArbiter>,
    threshold: f64,
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl RuleObserver {
    pub fn new(arbiter: Arc<InputArbiter>, threshold: f64, delay: Duration) -> Self {
        Self {
            inner: TracingDisplay::default(),
            arbiter,
            threshold,
            delay,
            pending: None,
        }
    }

    fn join_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            let _ = handle.join();
        }
    }
}

impl StimulusDisplay for RuleObserver {
    fn fixation(&mut self) {
        self.inner.fixation();
    }

    fn blank(&mut self) {
        self.inner.blank();
    }

    fn stimulus(&mut self, orientation: f64, stripes: u32) {
        self.join_pending();
        self.inner.stimulus(orientation, stripes);
        let response = rb_label(orientation, self.threshold).expected_response();
        let arbiter = self.arbiter.clone();
        let delay = self.delay;
        self.pending = Some(thread::spawn(move || {
            thread::sleep(delay);
            arbiter.emit_response(response);
        }));
    }

    fn feedback(&mut self, feedback: Feedback) {
        self.inner.feedback(feedback);
    }
}

impl Drop for RuleObserver {
    fn drop(&mut self) {
        self.join_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gabor_runner::config::InputConfig;
    use gabor_runner::input::TrialSignal;
    use gabor_runner::Response;

    #[test]
    fn key_names_follow_browser_conventions() {
        assert_eq!(key_name(KeyCode::Esc).as_deref(), Some("Escape"));
        assert_eq!(key_name(KeyCode::Char('a')).as_deref(), Some("a"));
        assert_eq!(key_name(KeyCode::Char(' ')).as_deref(), Some("Space"));
        assert_eq!(key_name(KeyCode::Tab), None);
    }

    #[test]
    fn rule_observer_answers_by_orientation() {
        let arbiter = Arc::new(InputArbiter::new(&InputConfig::default()));
        let mut observer = RuleObserver::new(arbiter.clone(), 7.0, Duration::from_millis(1));
        let sub = arbiter.subscribe();
        observer.stimulus(12.0, 4);
        match sub.recv_timeout(Duration::from_secs(2)) {
            Ok(TrialSignal::Response { response, .. }) => assert_eq!(response, Response::B),
            other => panic!("unexpected signal: {:?}", other),
        }
        drop(sub);
        observer.join_pending();
        assert_eq!(observer.inner.stimuli_shown, 1);
    }
}
