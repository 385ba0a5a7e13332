use crate::{
    config::default_trigger, AcquisitionEngine, AcquisitionMode, ChannelConfig, ChannelId,
    DisplayFrame, EngineError, SessionState,
};
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{info, warn};
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Style, Stylize},
    symbols::{border, Marker},
    text::{Line, Text},
    widgets::{Axis, Block, Chart, Dataset, GraphType, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeExit {
    Quit,
    Timeout,
}

/// Envelope of one channel, scaled to ±1 of its full scale.
#[derive(Debug, Default)]
struct Series {
    label: String,
    min: Vec<(f64, f64)>,
    max: Vec<(f64, f64)>,
    torn: bool,
}

pub struct Scope {
    engine: AcquisitionEngine,
    refresh: Duration,
    run_for: Option<Duration>,
    t_begin: Instant,
    series: [Option<Series>; 2],
    window_s: f64,
    message: Option<String>,
    exit: Option<ScopeExit>,
}

impl Scope {
    pub fn new(engine: AcquisitionEngine, run_for: Option<Duration>) -> Self {
        let refresh = engine.config().refresh;
        let window_s = engine.config().window.as_secs_f64();
        Self {
            engine,
            refresh,
            run_for,
            t_begin: Instant::now(),
            series: [None, None],
            window_s,
            message: None,
            exit: None,
        }
    }

    pub fn engine_mut(&mut self) -> &mut AcquisitionEngine {
        &mut self.engine
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<ScopeExit> {
        let ticker = tick(self.refresh);
        self.t_begin = Instant::now();

        while self.exit.is_none() {
            let _ = ticker.recv();

            if let Some(frame) = self.engine.tick() {
                self.show(frame);
            }
            self.handle_events()?;

            if let Some(limit) = self.run_for {
                if self.t_begin.elapsed() >= limit {
                    self.exit = Some(ScopeExit::Timeout);
                }
            }

            terminal.draw(|f| self.draw(f))?;
        }
        Ok(self.exit.unwrap_or(ScopeExit::Quit))
    }

    fn show(&mut self, frame: DisplayFrame) {
        self.window_s = frame.window_s;
        self.series = frame.traces.map(|trace| {
            trace.map(|t| {
                let (min, max) = t.normalized();
                Series {
                    label: format!("{} ±{}V", t.channel, t.full_scale),
                    min,
                    max,
                    torn: t.torn,
                }
            })
        });
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        let result = match key_event.code {
            KeyCode::Char('q') => {
                self.exit = Some(ScopeExit::Quit);
                Ok(())
            }
            KeyCode::Char(' ') => self.toggle_run(),
            KeyCode::Char('r') => self.toggle_recording(),
            KeyCode::Char('t') => self.toggle_trigger(),
            KeyCode::Char('+') => self.scale_window(2.0),
            KeyCode::Char('-') => self.scale_window(0.5),
            KeyCode::Char('a') => self.cycle_range(ChannelId::A),
            KeyCode::Char('b') => self.cycle_range(ChannelId::B),
            KeyCode::Char('m') => self.toggle_mode(),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("{e}");
            self.message = Some(e.to_string());
        }
    }

    fn toggle_run(&mut self) -> Result<(), EngineError> {
        self.message = None;
        if self.engine.state().is_running() {
            self.engine.stop()
        } else {
            self.engine.start()
        }
    }

    fn toggle_recording(&mut self) -> Result<(), EngineError> {
        if self.engine.is_recording() {
            if let Some(summary) = self.engine.stop_recording()? {
                self.message = Some(format!(
                    "saved {} acquisitions to {}",
                    summary.acquisitions_saved,
                    summary.directory.display()
                ));
            }
            Ok(())
        } else {
            self.engine.start_recording(None)?;
            self.message = Some("recording".into());
            Ok(())
        }
    }

    fn toggle_trigger(&mut self) -> Result<(), EngineError> {
        if self.engine.trigger().is_some() {
            return self.engine.disarm_trigger();
        }
        let source = if self.engine.channels().is_enabled(ChannelId::A) {
            ChannelId::A
        } else {
            ChannelId::B
        };
        let realized = self.engine.arm_trigger(default_trigger(source))?;
        self.message = Some(format!("trigger on {source} at {realized}"));
        Ok(())
    }

    /// Applies a change that needs the acquisition stopped, resuming it
    /// afterwards.
    fn restarting(
        &mut self,
        change: impl FnOnce(&mut AcquisitionEngine) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let was_running = self.engine.state().is_running();
        self.engine.stop()?;
        let result = change(&mut self.engine);
        if was_running {
            self.engine.start()?;
        }
        result
    }

    fn scale_window(&mut self, factor: f64) -> Result<(), EngineError> {
        let window = self.engine.config().window.mul_f64(factor);
        self.restarting(|engine| engine.reconfigure_window(window))
    }

    fn cycle_range(&mut self, channel: ChannelId) -> Result<(), EngineError> {
        let current = *self.engine.channels().get(channel);
        let next = ChannelConfig {
            range: current.range.next(),
            ..current
        };
        self.restarting(|engine| engine.configure_channel(channel, next))?;
        info!("channel {channel} range {}", next.range);
        Ok(())
    }

    fn toggle_mode(&mut self) -> Result<(), EngineError> {
        let mode = match self.engine.config().mode {
            AcquisitionMode::Streaming => AcquisitionMode::Block,
            AcquisitionMode::Block => AcquisitionMode::Streaming,
        };
        self.restarting(|engine| engine.set_mode(mode))
    }

    fn status_text(&self) -> Text<'_> {
        let status = self.engine.status();
        let state = match status.state {
            SessionState::Idle => status.state.to_string().red(),
            _ => status.state.to_string().green(),
        };
        let depth = match status.mode {
            AcquisitionMode::Streaming => format!("{} samples", status.ring_capacity),
            AcquisitionMode::Block => format!("{} samples/capture", status.block_len),
        };
        let trigger = match &status.trigger {
            Some((config, realized)) => format!("{} {} {realized}", config.source, config.direction),
            None => "free running".into(),
        };
        let recording = if status.recording {
            format!("{} saved", status.acquisitions_saved).red()
        } else {
            "off".into()
        };
        let note = self
            .message
            .clone()
            .or_else(|| status.condition.as_ref().map(|c| c.to_string()))
            .unwrap_or_default();
        let torn = self.series.iter().flatten().any(|s| s.torn);

        Text::from(vec![
            Line::from(vec![
                "State: ".into(),
                state,
                " Mode: ".into(),
                status.mode.to_string().yellow(),
                " Interval: ".into(),
                format!("{} ns", status.timebase.interval_ns).yellow(),
                " Window: ".into(),
                format!("{:?} ({depth})", status.window).yellow(),
            ]),
            Line::from(vec![
                "Rate: ".into(),
                format!("{:.3} MS/s", status.effective_rate_hz / 1e6).yellow(),
                " Received: ".into(),
                status.samples_received.to_string().yellow(),
                " Dropped: ".into(),
                status.dropped_samples.to_string().yellow(),
                " Captures: ".into(),
                status.captures_completed.to_string().yellow(),
            ]),
            Line::from(vec![
                "Trigger: ".into(),
                trigger.yellow(),
                " Recording: ".into(),
                recording,
                if torn { " [torn]".magenta() } else { "".into() },
            ]),
            Line::from(note.italic()),
        ])
    }
}

impl Widget for &Scope {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let [chart_area, status_area] =
            Layout::vertical([Constraint::Min(8), Constraint::Length(6)]).areas(area);

        let colors = [Style::new().yellow(), Style::new().cyan()];
        let datasets: Vec<Dataset> = self
            .series
            .iter()
            .zip(colors)
            .filter_map(|(series, style)| series.as_ref().map(|s| (s, style)))
            .flat_map(|(s, style)| {
                [
                    Dataset::default()
                        .name(s.label.clone())
                        .marker(Marker::Braille)
                        .graph_type(GraphType::Line)
                        .style(style)
                        .data(&s.max),
                    Dataset::default()
                        .marker(Marker::Braille)
                        .graph_type(GraphType::Line)
                        .style(style)
                        .data(&s.min),
                ]
            })
            .collect();

        let window_ms = self.window_s * 1e3;
        let chart = Chart::new(datasets)
            .block(Block::bordered().title(Line::from(" Scope ".bold()).centered()))
            .x_axis(
                Axis::default()
                    .title("ms")
                    .bounds([0.0, self.window_s])
                    .labels(["0".to_string(), format!("{window_ms:.3}")]),
            )
            .y_axis(
                Axis::default()
                    .title("full scale")
                    .bounds([-1.0, 1.0])
                    .labels(["-1", "0", "1"]),
            );
        chart.render(chart_area, buf);

        let instructions = Line::from(vec![
            " Run ".into(),
            "<Space>".blue().bold(),
            " Record ".into(),
            "<R>".blue().bold(),
            " Trigger ".into(),
            "<T>".blue().bold(),
            " Window ".into(),
            "<+/->".blue().bold(),
            " Range ".into(),
            "<A/B>".blue().bold(),
            " Mode ".into(),
            "<M>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(Line::from(" Status ".bold()).centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        Paragraph::new(self.status_text())
            .block(block)
            .render(status_area, buf);
    }
}
