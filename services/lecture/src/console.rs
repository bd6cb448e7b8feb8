//! Line-oriented terminal front end: typed commands in, session snapshots out.

use lecture_core::{Command, PlaybackState, SessionView};

/// What one line of terminal input asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Command(Command),
    Help,
    Quit,
    Unknown(String),
}

pub const HELP: &str = "\
commands:
  play              start or continue the lecture
  restart           start over from the first chunk
  pause | stop      pause keeps the position, stop ends the session
  interrupt         halt narration to ask a question
  ask <question>    type a question (interrupts if needed)
  resume            continue the lecture after a question
  mic on|off        toggle the microphone
  quit";

/// Parse one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<ConsoleInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match (word.to_lowercase().as_str(), rest) {
        ("play" | "start", "") => ConsoleInput::Command(Command::Start { resume: true }),
        ("restart", "") => ConsoleInput::Command(Command::Restart),
        ("pause", "") => ConsoleInput::Command(Command::Pause),
        ("stop", "") => ConsoleInput::Command(Command::Stop),
        ("interrupt" | "i", "") => ConsoleInput::Command(Command::Interrupt),
        ("resume" | "continue", "") => ConsoleInput::Command(Command::Resume),
        ("ask" | "?", question) if !question.is_empty() => {
            ConsoleInput::Command(Command::SendQuestion(question.to_string()))
        }
        ("mic", switch) => match switch.to_lowercase().as_str() {
            "on" => ConsoleInput::Command(Command::SetMicrophone(true)),
            "off" => ConsoleInput::Command(Command::SetMicrophone(false)),
            _ => ConsoleInput::Unknown(line.to_string()),
        },
        ("help" | "h", "") => ConsoleInput::Help,
        ("quit" | "exit" | "q", "") => ConsoleInput::Quit,
        _ => ConsoleInput::Unknown(line.to_string()),
    };
    Some(input)
}

/// One status line for a snapshot.
pub fn status_line(view: &SessionView) -> String {
    let title = view.lecture_title.as_deref().unwrap_or("lecture");
    let mut line = if view.total_chunks > 0 {
        format!(
            "[{}] {} {}/{}",
            view.state,
            title,
            (view.chunk_index + 1).min(view.total_chunks),
            view.total_chunks
        )
    } else {
        format!("[{}] {}", view.state, title)
    };
    if let Some(section) = &view.section_name {
        line.push_str(&format!(" ({section})"));
    }
    if view.mic_enabled {
        line.push_str(" mic:on");
    }
    line
}

/// Lines worth printing when the snapshot moves from `previous` to `current`.
///
/// Only changes are reported so a stream of small updates (assistant text growing delta
/// by delta) does not flood the terminal.
pub fn render_changes(previous: &SessionView, current: &SessionView) -> Vec<String> {
    let mut lines = Vec::new();
    if previous.state != current.state
        || previous.chunk_index != current.chunk_index
        || previous.mic_enabled != current.mic_enabled
    {
        lines.push(status_line(current));
    }
    if current.chunk_text != previous.chunk_text {
        if let Some(text) = &current.chunk_text {
            lines.push(format!("  > {text}"));
        }
    }
    if current.last_transcript != previous.last_transcript {
        if let Some(transcript) = &current.last_transcript {
            lines.push(format!("  you: {transcript}"));
        }
    }
    // The answer is printed once it is complete.
    if previous.state == PlaybackState::Answering
        && current.state != PlaybackState::Answering
        && !previous.assistant_text.is_empty()
    {
        lines.push(format!("  tutor: {}", previous.assistant_text));
    }
    if current.notice != previous.notice {
        if let Some(notice) = &current.notice {
            lines.push(format!("  note: {notice}"));
        }
    }
    if current.error_message != previous.error_message {
        if let Some(error) = &current.error_message {
            lines.push(format!("  error: {error}"));
        }
    }
    lines
}
