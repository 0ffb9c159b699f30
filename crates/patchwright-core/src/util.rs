/// Shorten `s` to at most `max` characters, ending with "..." when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the first `max` characters of a tool or checker output and mark the cut.
pub fn clip_output(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{}\n…(truncated)", head)
}

/// Canonical form for project-relative paths coming from models and tools.
pub fn normalize_rel_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut rest = unified.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_string()
}

/// Remove ANSI escape sequences (colours, cursor movement) from command output.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI: parameters and intermediates, then one final byte in @..~
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC: runs until BEL or ESC \
                while let Some(next) = chars.next() {
                    if next == '\u{7}' {
                        break;
                    }
                    if next == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abc", 0), "");
    }

    #[test]
    fn test_clip_output_marks_truncation() {
        assert_eq!(clip_output("abcdef", 3), "abc\n…(truncated)");
        assert_eq!(clip_output("abc", 3), "abc");
    }

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path("./src\\App.tsx"), "src/App.tsx");
        assert_eq!(normalize_rel_path(" ././a.ts "), "a.ts");
    }

    #[test]
    fn test_strip_ansi_removes_colour_codes() {
        let coloured = "\u{1b}[96msrc/a.ts\u{1b}[0m:\u{1b}[93m1\u{1b}[0m error";
        assert_eq!(strip_ansi(coloured), "src/a.ts:1 error");
    }
}
