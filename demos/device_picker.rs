//! Interactive BLE device picker
//!
//! Run with: cargo run --example device_picker
//!
//! Scans in the background and lists every peripheral seen so far, ordered by
//! identifier. Selecting one starts a controller session with it.
//!
//! ## Keyboard Controls
//!
//! | Key | Action |
//! |-----|--------|
//! | `Up/Down`, `W/S` | Navigate device list |
//! | `Enter` | Select device |
//! | `0-9` | Select device by number |
//! | `R` | Forget all devices and rescan |
//! | `Q/Esc` | Quit |

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use mug_control_ble::{
    AdvertisementSighting, BleCentral, ControllerConfig, Discovery, DiscoveryLedger, Error,
    Result, SessionSupervisor, Snapshot, StatusEvent,
};
use ratatui::{
    prelude::*,
    widgets::{block::Title, *},
};
use std::io::{self, stdout, Stdout};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Main terminal type alias
type Terminal = ratatui::Terminal<CrosstermBackend<Stdout>>;

fn setup_terminal() -> io::Result<Terminal> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()
}

/// Picker state
struct App {
    ledger: Arc<DiscoveryLedger>,
    devices: Snapshot,
    selected: usize,
    message: Option<String>,
}

impl App {
    fn new(ledger: Arc<DiscoveryLedger>) -> Self {
        let devices = ledger.snapshot();
        Self {
            ledger,
            devices,
            selected: 0,
            message: None,
        }
    }

    /// Pick up new sightings, keeping the cursor on the same device.
    fn update_devices(&mut self) {
        let current = self
            .devices
            .get(self.selected)
            .map(|d| d.identifier.clone());
        self.devices = self.ledger.snapshot();

        self.selected = current
            .and_then(|id| self.devices.position(&id))
            .unwrap_or(self.selected)
            .min(self.devices.len().saturating_sub(1));
    }

    fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    fn select_next(&mut self) {
        if self.selected + 1 < self.devices.len() {
            self.selected += 1;
        }
    }

    fn refresh(&mut self) {
        self.ledger.clear();
        self.devices = self.ledger.snapshot();
        self.selected = 0;
        self.message = Some("Refreshing device list...".to_string());
    }

    fn pick(&mut self, index: usize) -> Option<AdvertisementSighting> {
        match self.devices.get(index) {
            Some(device) => Some(device.clone()),
            None if self.devices.is_empty() => None,
            None => {
                self.message = Some(format!(
                    "Invalid number. Must be 0-{}",
                    self.devices.len() - 1
                ));
                None
            }
        }
    }
}

fn render_ui(frame: &mut Frame, app: &App) {
    let size = frame.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(5),    // Device list
            Constraint::Length(1), // Status bar
        ])
        .split(size);

    render_header(frame, chunks[0]);
    render_devices(frame, chunks[1], app);
    render_status_bar(frame, chunks[2], app);
}

fn render_header(frame: &mut Frame, area: Rect) {
    let header = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(Title::from(" BLE DEVICE PICKER ").alignment(Alignment::Center))
        .title(
            Title::from(" [W/S] Move  [Enter] Select  [R] Refresh  [Q] Quit ")
                .alignment(Alignment::Right)
                .position(block::Position::Top),
        );

    frame.render_widget(header, area);
}

fn render_devices(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default().borders(Borders::ALL).title(" Devices ");

    if app.devices.is_empty() {
        let paragraph = Paragraph::new("No devices found. Scanning...").block(block);
        frame.render_widget(paragraph, area);
        return;
    }

    let name_width = app
        .devices
        .iter()
        .map(|d| d.display_name().chars().count())
        .max()
        .unwrap_or(0)
        .clamp(8, 32);

    let items: Vec<ListItem> = app
        .devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let age = DiscoveryLedger::age(device).as_secs();
            let rssi = device
                .rssi
                .map(|r| format!("{} dBm", r))
                .unwrap_or_else(|| "--".to_string());
            let name: String = device.display_name().chars().take(name_width).collect();

            let (cursor, style) = if i == app.selected {
                ("> ", Style::default().bg(Color::DarkGray).fg(Color::White))
            } else {
                ("  ", Style::default())
            };

            ListItem::new(Line::from(vec![
                Span::styled(format!("{}{:>2} ", cursor, i), style),
                Span::styled(format!("{:<width$} ", name, width = name_width), style),
                Span::styled(format!("| {} ", device.identifier), style),
                Span::styled(format!("| {:>8} ", rssi), style),
                Span::styled(format!("| {}s ago", age), style),
            ]))
        })
        .collect();

    let list = List::new(items).block(block);
    frame.render_widget(list, area);
}

fn render_status_bar(frame: &mut Frame, area: Rect, app: &App) {
    let selected = app
        .devices
        .get(app.selected)
        .map(|d| d.display_name().to_string())
        .unwrap_or_else(|| "None".to_string());

    let status = match &app.message {
        Some(message) => format!(" {} ", message),
        None => format!(
            " Selected: {} | Total devices: {} ",
            selected,
            app.devices.len()
        ),
    };

    let paragraph =
        Paragraph::new(status).style(Style::default().bg(Color::DarkGray).fg(Color::White));

    frame.render_widget(paragraph, area);
}

async fn run_app(terminal: &mut Terminal, mut app: App) -> Result<Option<AdvertisementSighting>> {
    loop {
        app.update_devices();

        terminal
            .draw(|frame| render_ui(frame, &app))
            .map_err(|e| Error::Internal(format!("Draw error: {}", e)))?;

        let has_event = event::poll(Duration::from_millis(200))
            .map_err(|e| Error::Internal(format!("Poll error: {}", e)))?;

        if !has_event {
            continue;
        }

        let event = event::read().map_err(|e| Error::Internal(format!("Read error: {}", e)))?;
        if let Event::Key(key) = event {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            app.message = None;

            match key.code {
                KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(None),
                KeyCode::Up | KeyCode::Char('w') | KeyCode::Char('W') => app.select_prev(),
                KeyCode::Down | KeyCode::Char('s') | KeyCode::Char('S') => app.select_next(),
                KeyCode::Char('r') | KeyCode::Char('R') => app.refresh(),
                KeyCode::Enter => {
                    if let Some(device) = app.pick(app.selected) {
                        return Ok(Some(device));
                    }
                }
                KeyCode::Char(c) if c.is_ascii_digit() => {
                    let index = c.to_digit(10).unwrap_or(0) as usize;
                    if let Some(device) = app.pick(index) {
                        return Ok(Some(device));
                    }
                }
                _ => {}
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to a file so it doesn't interfere with the TUI
    if let Ok(file) = std::fs::File::create("device_picker.log") {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }

    let config = ControllerConfig::default();
    let central = Arc::new(BleCentral::new().await?);
    let discovery = Arc::new(Discovery::new(central.clone(), &config));
    let ledger = discovery.ledger().clone();

    // Scan in the background until a device is picked
    let scanning = CancellationToken::new();
    let scan_task = {
        let discovery = discovery.clone();
        let cancel = scanning.clone();
        let rescan_delay = config.rescan_delay;
        tokio::spawn(async move {
            while !cancel.is_cancelled() {
                if let Err(e) = discovery.scan_once(&cancel).await {
                    tracing::warn!("Scan error: {}", e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(rescan_delay) => {}
                }
            }
        })
    };

    let mut terminal = setup_terminal()
        .map_err(|e| Error::Internal(format!("Failed to setup terminal: {}", e)))?;

    let result = run_app(&mut terminal, App::new(ledger)).await;

    let _ = restore_terminal(&mut terminal);
    scanning.cancel();
    let _ = scan_task.await;

    let Some(device) = result? else {
        return Ok(());
    };

    println!(
        "Selected {} ({}). Press Ctrl+C to stop.",
        device.display_name(),
        device.identifier
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    let supervisor = SessionSupervisor::new(central, config)?;
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StatusEvent::MeasuredRead(reading)) => println!("Drink: {}", reading),
                Ok(StatusEvent::SetpointChanged { to, .. }) => println!("Target: {:.2}°C", to),
                Ok(StatusEvent::SessionEnded(_)) => {}
                Ok(other) => println!("{:?}", other),
                Err(RecvError::Lagged(missed)) => println!("({} status updates dropped)", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let outcome = supervisor.run(&device.identifier, &cancel).await;
    println!("Session ended: {}", outcome);

    Ok(())
}
