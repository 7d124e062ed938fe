use std::fmt::Display;

use console::{style, Color, StyledObject};

use crate::report::Outcome;

type Styled = StyledObject<String>;

fn paint(text: impl Display, color: Color) -> Styled {
    style(text.to_string()).fg(color)
}

/// Durations, sizes and in-flight steps.
pub fn highlight(text: impl Display) -> Styled {
    paint(text, Color::Yellow).bright()
}

pub fn success(text: impl Display) -> Styled {
    paint(text, Color::Green).bright()
}

pub fn failure(text: impl Display) -> Styled {
    paint(text, Color::Red).bright()
}

/// Paths, commands and identifiers.
pub fn value(text: impl Display) -> Styled {
    paint(text, Color::Cyan)
}

pub fn dim(text: impl Display) -> Styled {
    style(text.to_string()).dim()
}

pub fn heading(text: impl Display) -> Styled {
    style(text.to_string()).bright().underlined()
}

pub fn banner(text: impl Display) -> Styled {
    paint(text, Color::Magenta).bold()
}

pub fn outcome(outcome: Outcome) -> Styled {
    match outcome {
        Outcome::Succeeded => success("succeeded"),
        Outcome::Failed => failure("failed"),
        Outcome::Running => highlight("running"),
    }
}
