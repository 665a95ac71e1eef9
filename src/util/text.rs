use std::borrow::Cow;

fn is_stripped_control(c: char) -> bool {
    c == '\u{7f}' || (c < ' ' && !matches!(c, '\t' | '\n' | '\r'))
}

/// Removes control characters and ANSI escape sequences from feed text.
///
/// Feed titles and descriptions end up in JSON payloads and terminal output,
/// so anything that could drive a terminal is dropped:
/// - ASCII controls other than tab, newline and carriage return, plus DEL
/// - CSI sequences (`ESC [` up to a final byte in `@..=~`)
/// - OSC sequences (`ESC ]` up to BEL or `ESC \`)
/// - any other bare ESC
///
/// Clean input is returned borrowed.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\u{7}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
        } else if !is_stripped_control(c) {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Collapses every whitespace run to a single space and trims the ends.
///
/// Used for single-line fields such as titles and artist names.
pub fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
