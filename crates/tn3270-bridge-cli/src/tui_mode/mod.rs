//! Interactive TUI mode for running flows.
//!
//! Provides a live terminal UI showing:
//! - The host screen as of the last completed step
//! - Step list with status, including recovery and retry passes
//! - Run status and controls

// TUI-specific lint allowances - ratatui layouts have fixed indices
#![allow(clippy::indexing_slicing)]

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use miette::{IntoDiagnostic, Result};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tn3270_bridge::runner::{CancelToken, FlowRunner, ProgressCallback, ProgressEvent, RunOptions};
use tn3270_bridge::session::SessionManager;
use tn3270_bridge::{BridgeError, FlowDefinition, FlowOutcome, RunStatus, Screen, StepPhase, StepStatus};

/// Run a flow in interactive TUI mode. Returns the outcome once the user quits.
pub fn run_tui(
    runner: FlowRunner,
    manager: Arc<SessionManager>,
    flow: FlowDefinition,
    options: RunOptions<'static>,
) -> Result<Option<FlowOutcome>> {
    enable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).into_diagnostic()?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).into_diagnostic()?;

    let (tx, rx) = mpsc::channel::<TuiEvent>();
    let mut app = App::new(&flow);
    let cancel = options.cancel.clone();

    let finish_tx = tx.clone();
    let worker = thread::spawn(move || {
        let callback = TuiProgressCallback { tx, manager };
        let options = RunOptions {
            progress: Some(&callback),
            ..options
        };
        let result = runner.run(&flow, options);
        let _ = finish_tx.send(TuiEvent::RunFinished(Box::new(result)));
    });

    let result = run_app(&mut terminal, &mut app, &rx, &cancel);

    disable_raw_mode().into_diagnostic()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).into_diagnostic()?;
    terminal.show_cursor().into_diagnostic()?;

    // Quitting mid-run cancels at the next step boundary; wait for the runner
    // so the session is settled before the process exits.
    if app.outcome.is_none() && app.error_message.is_none() {
        cancel.cancel();
        if worker.join().is_err() {
            return Err(miette::miette!("flow worker panicked"));
        }
        while let Ok(event) = rx.try_recv() {
            app.handle_event(event);
        }
    }
    result?;
    if let Some(message) = app.error_message {
        return Err(miette::miette!("{message}"));
    }
    Ok(app.outcome)
}

/// Events sent from the runner thread to the TUI.
enum TuiEvent {
    Progress(ProgressEvent),
    Snapshot(Screen),
    RunFinished(Box<Result<FlowOutcome, BridgeError>>),
}

/// Forwards progress and, after each step, the session's latest screen.
struct TuiProgressCallback {
    tx: Sender<TuiEvent>,
    manager: Arc<SessionManager>,
}

impl TuiProgressCallback {
    fn latest_screen(&self) -> Option<Screen> {
        let status = self.manager.sessions().ok()?.into_iter().next()?;
        let handle = self.manager.get(status.id)?;
        self.manager.last_screen(&handle).ok().flatten()
    }
}

impl ProgressCallback for TuiProgressCallback {
    fn on_progress(&self, event: &ProgressEvent) {
        let _ = self.tx.send(TuiEvent::Progress(event.clone()));
        if matches!(event, ProgressEvent::StepCompleted { .. }) {
            if let Some(screen) = self.latest_screen() {
                let _ = self.tx.send(TuiEvent::Snapshot(screen));
            }
        }
    }
}

struct StepState {
    name: String,
    phase: StepPhase,
    status: Option<StepStatus>,
    duration_ms: Option<u64>,
}

struct App {
    flow_name: String,
    planned: usize,
    steps: Vec<StepState>,
    screen: Option<Screen>,
    running: bool,
    outcome: Option<FlowOutcome>,
    error_message: Option<String>,
    scroll_offset: u16,
}

impl App {
    fn new(flow: &FlowDefinition) -> Self {
        Self {
            flow_name: flow.name.clone(),
            planned: flow.steps.len(),
            steps: Vec::new(),
            screen: None,
            running: true,
            outcome: None,
            error_message: None,
            scroll_offset: 0,
        }
    }

    fn handle_event(&mut self, event: TuiEvent) {
        match event {
            TuiEvent::Progress(progress) => match progress {
                ProgressEvent::StepStarted { phase, name, .. } => {
                    self.steps.push(StepState {
                        name,
                        phase,
                        status: None,
                        duration_ms: None,
                    });
                }
                ProgressEvent::StepCompleted {
                    status,
                    duration_ms,
                    ..
                } => {
                    if let Some(step) = self.steps.last_mut() {
                        step.status = Some(status);
                        step.duration_ms = Some(duration_ms);
                    }
                }
                ProgressEvent::RunCompleted { .. } => self.running = false,
                ProgressEvent::RunStarted { .. } | ProgressEvent::RecoveryStarted { .. } => {}
            },
            TuiEvent::Snapshot(screen) => self.screen = Some(screen),
            TuiEvent::RunFinished(result) => {
                self.running = false;
                match *result {
                    Ok(outcome) => self.outcome = Some(outcome),
                    Err(err) => self.error_message = Some(err.to_string()),
                }
            }
        }
    }
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    rx: &Receiver<TuiEvent>,
    cancel: &CancelToken,
) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app)).into_diagnostic()?;

        while let Ok(event) = rx.try_recv() {
            app.handle_event(event);
        }

        if event::poll(Duration::from_millis(50)).into_diagnostic()? {
            if let Event::Key(key) = event::read().into_diagnostic()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char('c') if app.running => cancel.cancel(),
                        KeyCode::Up | KeyCode::Char('k') => {
                            app.scroll_offset = app.scroll_offset.saturating_sub(1);
                        }
                        KeyCode::Down | KeyCode::Char('j') => {
                            app.scroll_offset = app.scroll_offset.saturating_add(1);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(f.area());

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(10), Constraint::Length(3)])
        .split(chunks[0]);

    render_screen(f, left_chunks[0], app);
    render_footer(f, left_chunks[1], app);
    render_steps(f, chunks[1], app);
}

fn render_screen(f: &mut Frame, area: Rect, app: &App) {
    let title = match &app.screen {
        Some(screen) if screen.keyboard_locked() => " Host (X SYSTEM) ".to_string(),
        Some(screen) => {
            let cursor = screen.cursor();
            format!(" Host ({},{}) ", cursor.row, cursor.col)
        }
        None => " Host ".to_string(),
    };
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    if let Some(screen) = &app.screen {
        let lines: Vec<Line> = screen
            .lines()
            .iter()
            .skip(usize::from(app.scroll_offset))
            .take(usize::from(inner.height))
            .map(|line| Line::from(line.as_str()).style(Style::default().fg(Color::Green)))
            .collect();
        f.render_widget(Paragraph::new(lines), inner);
    } else {
        let placeholder =
            Paragraph::new("Waiting for the first screen...").style(Style::default().fg(Color::DarkGray));
        f.render_widget(placeholder, inner);
    }
}

fn render_steps(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .title(format!(" {} ", app.flow_name))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let last = app.steps.len().saturating_sub(1);
    let items: Vec<ListItem> = app
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let (icon, style) = match step.status {
                Some(StepStatus::Passed) => ("✓", Style::default().fg(Color::Green)),
                Some(StepStatus::Failed) => ("✗", Style::default().fg(Color::Red)),
                None => ("▶", Style::default().fg(Color::Yellow)),
            };
            let phase = match step.phase {
                StepPhase::Main => "",
                StepPhase::Recovery => "  ↻ ",
                StepPhase::Retry => "  ⟳ ",
            };
            let duration = step
                .duration_ms
                .map(|d| format!(" ({d}ms)"))
                .unwrap_or_default();

            let content = Line::from(vec![
                Span::raw(phase),
                Span::styled(format!("{icon} "), style),
                Span::styled(step.name.as_str(), style),
                Span::styled(duration, Style::default().fg(Color::DarkGray)),
            ]);
            let mut item = ListItem::new(content);
            if i == last && app.running {
                item = item.style(Style::default().add_modifier(Modifier::BOLD));
            }
            item
        })
        .collect();

    f.render_widget(List::new(items).block(block), area);
}

fn render_footer(f: &mut Frame, area: Rect, app: &App) {
    let status = if app.running {
        Span::styled("Running", Style::default().fg(Color::Yellow))
    } else if let Some(outcome) = &app.outcome {
        match outcome.status {
            RunStatus::Succeeded => Span::styled("Succeeded", Style::default().fg(Color::Green)),
            RunStatus::Recovered => Span::styled("Recovered", Style::default().fg(Color::Yellow)),
            RunStatus::Canceled => Span::styled("Canceled", Style::default().fg(Color::DarkGray)),
            RunStatus::Failed | RunStatus::Pending | RunStatus::Running => {
                Span::styled("Failed", Style::default().fg(Color::Red))
            }
        }
    } else if let Some(err) = &app.error_message {
        Span::styled(
            format!("Error: {}", err.chars().take(50).collect::<String>()),
            Style::default().fg(Color::Red),
        )
    } else {
        Span::styled("Unknown", Style::default().fg(Color::DarkGray))
    };

    let main_done = app
        .steps
        .iter()
        .filter(|step| step.phase == StepPhase::Main && step.status.is_some())
        .count();
    let content = Line::from(vec![
        Span::raw(" "),
        status,
        Span::raw(" │ "),
        Span::raw(format!("Step {main_done}/{}", app.planned)),
        Span::raw(" │ "),
        Span::styled("[q]uit", Style::default().fg(Color::DarkGray)),
        Span::raw(" "),
        Span::styled("[c]ancel", Style::default().fg(Color::DarkGray)),
        Span::raw(" "),
        Span::styled("[↑↓]scroll", Style::default().fg(Color::DarkGray)),
    ]);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    f.render_widget(Paragraph::new(content).block(block), area);
}
