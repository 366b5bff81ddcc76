//! Stdin command parsing.

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Share,
    Leave,
    Show,
    Peers,
    Help,
    Quit,
    /// Anything that is not a command becomes the new document text.
    Replace(String),
}

impl Command {
    /// Parse one input line. `\n` in plain text becomes a newline.
    pub fn parse(line: &str) -> Self {
        match line.trim_end_matches(['\r', '\n']) {
            ":share" => Command::Share,
            ":leave" => Command::Leave,
            ":show" => Command::Show,
            ":peers" => Command::Peers,
            ":help" => Command::Help,
            ":quit" | ":q" => Command::Quit,
            text => Command::Replace(text.replace("\\n", "\n")),
        }
    }
}

pub const HELP: &str = "\
commands:
  :share   host the document on the LAN
  :leave   leave the session, keep the text
  :show    print the document
  :peers   list known peers
  :quit    leave and exit
anything else replaces the document text (\\n for newlines)";
