use std::io::IsTerminal;

use common_net::{clock::Micros, message::ControlMessage};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// What a keystroke asks the operator to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand {
    Pause,
    Play,
    Text(String),
    Quit,
}

impl KeyCommand {
    /// The control message for this command; `Quit` has none.
    pub fn to_message(&self, now: Micros) -> Option<ControlMessage> {
        match self {
            KeyCommand::Pause => Some(ControlMessage::pause(now)),
            KeyCommand::Play => Some(ControlMessage::play(now)),
            KeyCommand::Text(text) => Some(ControlMessage::text(text.clone(), now)),
            KeyCommand::Quit => None,
        }
    }
}

/// Line-oriented key mapping: `p` pauses, `r` resumes, `x` quits and `t`
/// sends text. The text may follow on the same line (`t hello`) or on the
/// next one.
#[derive(Debug, Default)]
pub struct KeyMapper {
    awaiting_text: bool,
}

impl KeyMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn awaiting_text(&self) -> bool {
        self.awaiting_text
    }

    pub fn feed(&mut self, line: &str) -> Option<KeyCommand> {
        if std::mem::take(&mut self.awaiting_text) {
            return text_command(line);
        }

        let line = line.trim();
        let (key, rest) = match line.split_once(char::is_whitespace) {
            Some((key, rest)) => (key, Some(rest)),
            None => (line, None),
        };
        match key {
            "p" => Some(KeyCommand::Pause),
            "r" => Some(KeyCommand::Play),
            "x" => Some(KeyCommand::Quit),
            "t" => match rest {
                Some(text) => text_command(text),
                None => {
                    self.awaiting_text = true;
                    None
                }
            },
            "" => None,
            other => {
                debug!(key = other, "unmapped key");
                None
            }
        }
    }
}

fn text_command(raw: &str) -> Option<KeyCommand> {
    let text = raw.trim();
    if text.is_empty() {
        debug!("empty overlay text ignored");
        return None;
    }
    Some(KeyCommand::Text(text.to_owned()))
}

/// Read commands from stdin when it is a terminal. Returns `None` for
/// headless runs (piped or closed stdin), in which case nothing is sent on
/// `commands`.
pub fn spawn_stdin_reader(commands: mpsc::UnboundedSender<KeyCommand>) -> Option<JoinHandle<()>> {
    if !std::io::stdin().is_terminal() {
        info!("stdin is not a terminal, keyboard control disabled");
        return None;
    }
    info!("keys: p = pause, r = play, t = text, x = quit");

    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(io::stdin()).lines();
        let mut mapper = KeyMapper::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(command) = mapper.feed(&line) {
                        let quit = command == KeyCommand::Quit;
                        if commands.send(command).is_err() || quit {
                            break;
                        }
                    } else if mapper.awaiting_text() {
                        info!("overlay text:");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "stdin read failed, keyboard control disabled");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_net::message::ControlKind;

    #[test]
    fn single_keys_map_to_commands() {
        let mut mapper = KeyMapper::new();
        assert_eq!(mapper.feed("p"), Some(KeyCommand::Pause));
        assert_eq!(mapper.feed(" r \n"), Some(KeyCommand::Play));
        assert_eq!(mapper.feed("x"), Some(KeyCommand::Quit));
        assert_eq!(mapper.feed("q"), None);
        assert_eq!(mapper.feed(""), None);
    }

    #[test]
    fn text_on_same_or_next_line() {
        let mut mapper = KeyMapper::new();
        assert_eq!(mapper.feed("t hello robot"), Some(KeyCommand::Text("hello robot".into())));

        assert_eq!(mapper.feed("t"), None);
        assert!(mapper.awaiting_text());
        assert_eq!(mapper.feed("  p  "), Some(KeyCommand::Text("p".into())));
        assert!(!mapper.awaiting_text());
    }

    #[test]
    fn empty_text_is_ignored() {
        let mut mapper = KeyMapper::new();
        assert_eq!(mapper.feed("t   "), None);
        assert!(mapper.awaiting_text());
        assert_eq!(mapper.feed("   "), None);
        assert!(!mapper.awaiting_text());
        assert_eq!(mapper.feed("p"), Some(KeyCommand::Pause));
    }

    #[test]
    fn commands_carry_timestamp() {
        let message = KeyCommand::Text("hi".into()).to_message(77).expect("message");
        assert_eq!(message.kind(), ControlKind::Text);
        assert_eq!(message.sent_at(), Some(77));
        assert_eq!(KeyCommand::Pause.to_message(1).map(|m| m.kind()), Some(ControlKind::Pause));
        assert_eq!(KeyCommand::Quit.to_message(1), None);
    }
}
