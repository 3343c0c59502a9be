//! Interactive per-entry action selection.
//!
//! In interactive mode every matching entry is shown on the terminal and the
//! user picks what happens to it with a single key press.
use async_trait::async_trait;
use crossterm::event::{Event, EventStream, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures::StreamExt;
use std::io::{self, Write};

use crate::feed::FeedEntry;
use crate::filter::total_size;

/// What to do with one matching entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    /// Submit to the download engine and remember it.
    Torrent,
    /// Save the `.torrent` file and remember it.
    Download,
    /// Remember it without acting.
    Skip,
    /// Leave it for the next run.
    SkipOnce,
    /// Stop processing entries.
    Quit,
}

/// Source of [`PromptChoice`]s.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn choose(&self, entry: &FeedEntry) -> io::Result<PromptChoice>;
}

const MENU: &str = "[t]orrent  [d]ownload  [s]kip  skip [o]nce  [q]uit";

/// Map a key press to a choice. Unbound keys return `None`.
pub fn choice_for_key(code: KeyCode, modifiers: KeyModifiers) -> Option<PromptChoice> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        return match code {
            KeyCode::Char('c') | KeyCode::Char('d') => Some(PromptChoice::Quit),
            _ => None,
        };
    }

    match code {
        KeyCode::Char('t') | KeyCode::Char('T') | KeyCode::Enter => Some(PromptChoice::Torrent),
        KeyCode::Char('d') | KeyCode::Char('D') => Some(PromptChoice::Download),
        KeyCode::Char('s') | KeyCode::Char('S') => Some(PromptChoice::Skip),
        KeyCode::Char('o') | KeyCode::Char('O') => Some(PromptChoice::SkipOnce),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(PromptChoice::Quit),
        _ => None,
    }
}

/// Restores cooked mode when dropped, including on early return.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// [`Prompter`] reading single key presses from the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn choose(&self, entry: &FeedEntry) -> io::Result<PromptChoice> {
        {
            let mut out = io::stdout().lock();
            writeln!(out)?;
            writeln!(out, "{} / {}", entry.feed_name, entry.title)?;
            if let Some(published) = entry.published_at {
                writeln!(out, "  published: {}", published.format("%Y-%m-%d %H:%M"))?;
            }
            let size = total_size(entry);
            if size > 0 {
                writeln!(out, "  size: {} MB", size / 1_000_000)?;
            }
            write!(out, "{MENU} > ")?;
            out.flush()?;
        }

        let raw = RawModeGuard::enable()?;
        let mut events = EventStream::new();

        let choice = loop {
            match events.next().await {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    if let Some(choice) = choice_for_key(key.code, key.modifiers) {
                        break choice;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                // input closed
                None => break PromptChoice::Quit,
            }
        };

        drop(raw);
        println!("{choice:?}");
        Ok(choice)
    }
}
