use agent_mux::{EventKind, Orchestrator, OutputLine, SessionSnapshot, SessionState, Stream};
use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};

use crate::actions::Action;

/// Output lines kept for the preview pane
const PREVIEW_LINES: usize = 200;

/// Theme colors
pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87),
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

impl Theme {
    fn state_icon(&self, state: SessionState) -> Span<'static> {
        match state {
            SessionState::Starting => Span::styled("◌ ", Style::default().fg(self.dim)),
            SessionState::Running => Span::styled("● ", Style::default().fg(self.warning)),
            SessionState::Idle => Span::styled("● ", Style::default().fg(self.success)),
            SessionState::AwaitingInput => Span::styled("? ", Style::default().fg(self.accent)),
            SessionState::Errored => Span::styled("✗ ", Style::default().fg(self.error)),
            SessionState::Terminated => Span::styled("○ ", Style::default().fg(self.dim)),
        }
    }

    fn state_color(&self, state: SessionState) -> Color {
        match state {
            SessionState::Starting | SessionState::Terminated => self.dim,
            SessionState::Running => self.warning,
            SessionState::Idle => self.success,
            SessionState::AwaitingInput => self.accent,
            SessionState::Errored => self.error,
        }
    }
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    /// Typing the command line of a new session
    Creating,
    /// Waiting for y/n before deleting the selected session
    Confirming,
    /// Editing the selected session's label
    Renaming,
    /// Keystrokes go to the selected session's stdin
    Typing,
}

/// Main application state
pub struct App {
    /// Sessions in display order
    pub sessions: Vec<SessionSnapshot>,
    /// Tail of the selected session's output
    pub preview: Vec<OutputLine>,
    /// Currently selected session index
    pub list_state: ListState,
    /// Current message to display (info or error)
    pub status_message: Option<Status>,
    /// Theme
    pub theme: Theme,
    /// Current input mode
    pub input_mode: InputMode,
    /// Text input buffer
    pub input_buffer: String,
    /// Pending action queue
    pub pending_actions: Vec<Action>,
    /// Core state changed since the last refresh
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Info(String),
    Error(String),
}

impl App {
    pub fn new() -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            sessions: Vec::new(),
            preview: Vec::new(),
            list_state,
            status_message: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            pending_actions: Vec::new(),
            dirty: true,
        }
    }

    /// Get the currently selected session
    pub fn selected_session(&self) -> Option<&SessionSnapshot> {
        self.list_state
            .selected()
            .and_then(|i| self.sessions.get(i))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Re-read the session list and the selected session's output.
    pub fn refresh(&mut self, orchestrator: &Orchestrator) {
        let selected_id = self.selected_session().map(|s| s.id);
        self.sessions = orchestrator.registry().display_order();

        // keep the selection on the same session when the order changes
        let index = selected_id
            .and_then(|id| self.sessions.iter().position(|s| s.id == id))
            .or_else(|| self.list_state.selected())
            .map(|i| i.min(self.sessions.len().saturating_sub(1)));
        self.list_state.select(index);

        self.preview = self
            .selected_session()
            .and_then(|s| orchestrator.registry().handle(s.id).ok())
            .map(|session| session.output().tail(PREVIEW_LINES))
            .unwrap_or_default();
        self.dirty = false;
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::Core(event) => {
                // output of sessions we are not showing needs no redraw
                let visible = self.selected_session().map(|s| s.id) == Some(event.session_id);
                if visible || !matches!(event.kind, EventKind::OutputAppended { .. }) {
                    self.dirty = true;
                }
                Ok(false)
            }
            Action::Error(msg) => {
                self.status_message = Some(Status::Error(msg));
                self.dirty = true;
                Ok(false)
            }
            Action::Notice(msg) => {
                self.status_message = Some(Status::Info(msg));
                self.dirty = true;
                Ok(false)
            }
            Action::Quit => Ok(true),
            _ => Ok(false),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if self.status_message.is_some() && self.input_mode == InputMode::Normal {
            self.status_message = None;
        }

        match self.input_mode {
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Creating => self.handle_creating_key(key),
            InputMode::Confirming => self.handle_confirming_key(key),
            InputMode::Renaming => self.handle_renaming_key(key),
            InputMode::Typing => self.handle_typing_key(key),
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(true);
            }
            KeyCode::Char('j') | KeyCode::Down => self.next_session(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_session(),
            KeyCode::Enter => {
                if let Some(id) = self.selected_session().map(|s| s.id) {
                    self.pending_actions.push(Action::SwitchSession(id));
                    self.input_mode = InputMode::Typing;
                    self.input_buffer.clear();
                }
            }
            KeyCode::Char('n') => {
                self.input_mode = InputMode::Creating;
                self.input_buffer.clear();
            }
            KeyCode::Char('d') => {
                if self.selected_session().is_some() {
                    self.input_mode = InputMode::Confirming;
                }
            }
            KeyCode::Char('r') => {
                if let Some(id) = self.selected_session().map(|s| s.id) {
                    self.pending_actions.push(Action::RestartSession(id));
                }
            }
            KeyCode::Char('e') => {
                if let Some(session) = self.selected_session() {
                    self.input_buffer = session.label.clone().unwrap_or_default();
                    self.input_mode = InputMode::Renaming;
                }
            }
            KeyCode::Char('p') => {
                if let Some(id) = self.selected_session().map(|s| s.id) {
                    self.pending_actions.push(Action::TogglePin(id));
                }
            }
            KeyCode::Char('y') => {
                if let Some(id) = self.selected_session().map(|s| s.id) {
                    self.pending_actions.push(Action::CopyOutput(id));
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_creating_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let command = self.input_buffer.trim().to_string();
                if !command.is_empty() {
                    self.pending_actions.push(Action::CreateSession(command));
                }
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_confirming_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => {
                if let Some(id) = self.selected_session().map(|s| s.id) {
                    self.pending_actions.push(Action::DeleteSession(id));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_renaming_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                if let Some(id) = self.selected_session().map(|s| s.id) {
                    let label = std::mem::take(&mut self.input_buffer);
                    self.pending_actions.push(Action::RenameSession(id, label));
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_typing_key(&mut self, key: KeyEvent) -> Result<bool> {
        let Some(id) = self.selected_session().map(|s| s.id) else {
            self.input_mode = InputMode::Normal;
            return Ok(false);
        };

        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.pending_actions.push(Action::Interrupt(id));
            }
            KeyCode::Enter => {
                let mut line = std::mem::take(&mut self.input_buffer).into_bytes();
                line.push(b'\n');
                self.pending_actions.push(Action::SendInput(id, line));
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn next_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i + 1 < self.sessions.len() => i + 1,
            _ => 0,
        };
        self.list_state.select(Some(i));
        self.dirty = true;
    }

    fn previous_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.sessions.len() - 1,
            Some(i) => i - 1,
        };
        self.list_state.select(Some(i));
        self.dirty = true;
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        match self.input_mode {
            InputMode::Creating => self.render_prompt_dialog(
                frame,
                " New Session ",
                "Command to run (e.g. claude, codex --full-auto):",
                "Press Enter to launch, Esc to cancel",
            ),
            InputMode::Renaming => self.render_prompt_dialog(
                frame,
                " Rename Session ",
                "Label (empty to clear):",
                "Press Enter to save, Esc to cancel",
            ),
            InputMode::Confirming => self.render_confirm_dialog(frame),
            InputMode::Normal | InputMode::Typing => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let live = self.sessions.iter().filter(|s| s.state.is_live()).count();
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " agent-mux ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("│ {} live / {} sessions", live, self.sessions.len()),
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(30), // Session list
                Constraint::Percentage(70), // Output preview
            ])
            .split(area);

        self.render_session_list(frame, chunks[0]);
        self.render_preview(frame, chunks[1]);
    }

    fn render_session_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.sessions.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No sessions. Press 'n' to launch one.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.sessions
                .iter()
                .map(|session| {
                    let mut spans = vec![self.theme.state_icon(session.state)];
                    if session.pinned {
                        spans.push(Span::styled("* ", Style::default().fg(self.theme.accent)));
                    }
                    spans.push(Span::styled(
                        session.display_name(),
                        Style::default().fg(self.theme.fg),
                    ));
                    ListItem::new(Line::from(spans))
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Sessions ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn render_preview(&self, frame: &mut Frame, area: Rect) {
        let Some(session) = self.selected_session() else {
            let empty = Paragraph::new(Line::from(Span::styled(
                "No session selected",
                Style::default().fg(self.theme.dim),
            )))
            .block(
                Block::default()
                    .title(" Output ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            );
            frame.render_widget(empty, area);
            return;
        };

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(4), Constraint::Min(0)])
            .split(area);

        let mut status = vec![
            Span::styled("State: ", Style::default().fg(self.theme.dim)),
            Span::styled(
                session.state.label(),
                Style::default().fg(self.theme.state_color(session.state)),
            ),
        ];
        if let Some(code) = session.exit_code {
            status.push(Span::styled(
                format!("  exit {code}"),
                Style::default().fg(self.theme.dim),
            ));
        }
        if let Some(pid) = session.pid {
            status.push(Span::styled(format!("  pid {pid}"), Style::default().fg(self.theme.dim)));
        }
        let mut details = vec![
            Line::from(vec![
                Span::styled("Command: ", Style::default().fg(self.theme.dim)),
                Span::styled(session.command.clone(), Style::default().fg(self.theme.fg)),
            ]),
            Line::from(status),
        ];
        if let Some(error) = &session.error {
            details.truncate(1);
            details.push(Line::from(Span::styled(
                error.clone(),
                Style::default().fg(self.theme.error),
            )));
        }
        let header = Paragraph::new(details).block(
            Block::default()
                .title(format!(" {} ", session.display_name()))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(header, chunks[0]);

        let output_area = chunks[1];
        let visible = output_area.height.saturating_sub(2) as usize;
        let skip = self.preview.len().saturating_sub(visible);
        let mut lines: Vec<Line> = self.preview[skip..]
            .iter()
            .map(|line| {
                let color = match line.stream {
                    Stream::Stdout => self.theme.fg,
                    Stream::Stderr => self.theme.warning,
                };
                Line::from(Span::styled(line.text.clone(), Style::default().fg(color)))
            })
            .collect();

        let border = if self.input_mode == InputMode::Typing {
            lines.push(Line::from(Span::styled(
                format!("▶ {}_", self.input_buffer),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            )));
            if lines.len() > visible {
                lines.remove(0);
            }
            self.theme.accent
        } else {
            self.theme.dim
        };

        let output = Paragraph::new(lines).block(
            Block::default()
                .title(" Output ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border)),
        );
        frame.render_widget(output, output_area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text = match self.input_mode {
            InputMode::Typing => " Enter: Send line │ Ctrl+C: Interrupt │ Esc: Back ",
            _ => " q: Quit │ j/k: Navigate │ Enter: Type │ n: New │ r: Restart │ e: Rename │ p: Pin │ y: Copy │ d: Delete ",
        };

        let content = match &self.status_message {
            Some(Status::Info(msg)) => Line::from(Span::styled(
                format!(" {msg} "),
                Style::default().fg(self.theme.success),
            )),
            Some(Status::Error(msg)) => Line::from(Span::styled(
                format!(" {msg} "),
                Style::default().fg(self.theme.error),
            )),
            None => Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim))),
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_prompt_dialog(&self, frame: &mut Frame, title: &str, prompt: &str, hint: &str) {
        let area = centered_rect(60, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(title.to_string())
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(prompt.to_string(), Style::default().fg(self.theme.fg))),
            Line::from(""),
            Line::from(Span::styled(
                format!("▶ {}_", self.input_buffer),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(hint.to_string(), Style::default().fg(self.theme.dim))),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Confirm Delete ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let (name, live) = self
            .selected_session()
            .map(|s| (s.display_name(), s.state.is_live()))
            .unwrap_or_else(|| ("unknown".to_string(), false));

        let warning = if live {
            "The process will be terminated and its output discarded."
        } else {
            "Its output will be discarded."
        };

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Delete session '{name}'?"),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(warning, Style::default().fg(self.theme.warning))),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }
}

/// Output lines as clipboard text, one per line.
pub fn clipboard_text(lines: &[OutputLine]) -> String {
    lines
        .iter()
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_mux::{SessionId, ToolKind};
    use chrono::Utc;
    use crossterm::event::KeyEventKind;

    fn key(code: KeyCode) -> Action {
        Action::KeyPress(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(c: char) -> Action {
        let mut event = KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL);
        event.kind = KeyEventKind::Press;
        Action::KeyPress(event)
    }

    fn snapshot(id: u64, state: SessionState) -> SessionSnapshot {
        SessionSnapshot {
            id: SessionId(id),
            kind: ToolKind::Claude,
            label: None,
            command: "claude".into(),
            cwd: "/tmp".into(),
            pid: Some(100 + id as u32),
            state,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            exit_code: None,
            error: None,
            pinned: false,
            lines: 0,
        }
    }

    fn app_with_sessions() -> App {
        let mut app = App::new();
        app.sessions = vec![
            snapshot(1, SessionState::Running),
            snapshot(2, SessionState::Idle),
        ];
        app
    }

    fn type_str(app: &mut App, text: &str) {
        for c in text.chars() {
            app.handle_action(key(KeyCode::Char(c))).unwrap();
        }
    }

    #[test]
    fn test_navigation_wraps() {
        let mut app = app_with_sessions();
        app.handle_action(key(KeyCode::Char('k'))).unwrap();
        assert_eq!(app.selected_session().unwrap().id, SessionId(2));
        app.handle_action(key(KeyCode::Char('j'))).unwrap();
        assert_eq!(app.selected_session().unwrap().id, SessionId(1));
    }

    #[test]
    fn test_create_dialog_queues_command_line() {
        let mut app = App::new();
        app.handle_action(key(KeyCode::Char('n'))).unwrap();
        assert_eq!(app.input_mode, InputMode::Creating);

        type_str(&mut app, "codex --full-auto");
        app.handle_action(key(KeyCode::Enter)).unwrap();

        assert_eq!(app.input_mode, InputMode::Normal);
        match app.take_pending_actions().as_slice() {
            [Action::CreateSession(command)] => assert_eq!(command, "codex --full-auto"),
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn test_delete_requires_confirmation() {
        let mut app = app_with_sessions();
        app.handle_action(key(KeyCode::Char('d'))).unwrap();
        assert!(app.take_pending_actions().is_empty());

        app.handle_action(key(KeyCode::Char('y'))).unwrap();
        assert!(matches!(
            app.take_pending_actions().as_slice(),
            [Action::DeleteSession(SessionId(1))]
        ));
    }

    #[test]
    fn test_typing_mode_sends_lines_and_interrupts() {
        let mut app = app_with_sessions();
        app.handle_action(key(KeyCode::Enter)).unwrap();
        assert_eq!(app.input_mode, InputMode::Typing);
        assert!(matches!(
            app.take_pending_actions().as_slice(),
            [Action::SwitchSession(SessionId(1))]
        ));

        // 'q' is text here, not quit
        type_str(&mut app, "yq");
        app.handle_action(key(KeyCode::Enter)).unwrap();
        app.handle_action(ctrl('c')).unwrap();

        match app.take_pending_actions().as_slice() {
            [Action::SendInput(SessionId(1), bytes), Action::Interrupt(SessionId(1))] => {
                assert_eq!(bytes, b"yq\n");
            }
            other => panic!("unexpected actions: {other:?}"),
        }

        app.handle_action(key(KeyCode::Esc)).unwrap();
        assert!(app.handle_action(key(KeyCode::Char('q'))).unwrap());
    }

    #[test]
    fn test_copy_output_of_selected_session() {
        let mut app = app_with_sessions();
        app.handle_action(key(KeyCode::Char('j'))).unwrap();
        app.handle_action(key(KeyCode::Char('y'))).unwrap();
        assert!(matches!(
            app.take_pending_actions().as_slice(),
            [Action::CopyOutput(SessionId(2))]
        ));

        let lines = vec![
            OutputLine::new("cargo test", Stream::Stdout),
            OutputLine::new("warning: unused import", Stream::Stderr),
        ];
        assert_eq!(clipboard_text(&lines), "cargo test\nwarning: unused import");
    }

    #[test]
    fn test_rename_prefills_current_label() {
        let mut app = app_with_sessions();
        app.sessions[0].label = Some("reviewer".into());

        app.handle_action(key(KeyCode::Char('e'))).unwrap();
        assert_eq!(app.input_buffer, "reviewer");
        app.handle_action(key(KeyCode::Backspace)).unwrap();
        app.handle_action(key(KeyCode::Enter)).unwrap();

        match app.take_pending_actions().as_slice() {
            [Action::RenameSession(SessionId(1), label)] => assert_eq!(label, "reviewe"),
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn test_background_output_does_not_mark_dirty() {
        let mut app = app_with_sessions();
        app.dirty = false;

        let record = |id, kind| agent_mux::EventRecord {
            seq: 0,
            session_id: SessionId(id),
            kind,
            at: Utc::now(),
        };
        app.handle_action(Action::Core(record(2, EventKind::OutputAppended { lines: 3 })))
            .unwrap();
        assert!(!app.dirty);

        app.handle_action(Action::Core(record(1, EventKind::OutputAppended { lines: 1 })))
            .unwrap();
        assert!(app.dirty);
    }
}
