//! Symbolic key names mapped to the escape sequences a terminal would send

/// Resolve a symbolic key name to its escape sequence.
///
/// Unknown names return `None`; callers fall back to treating the input as
/// literal text.
pub fn key_sequence(key: &str) -> Option<&'static str> {
    let seq = match key {
        "arrow_up" | "up" => "\x1b[A",
        "arrow_down" | "down" => "\x1b[B",
        "arrow_right" | "right" => "\x1b[C",
        "arrow_left" | "left" => "\x1b[D",
        "escape" => "\x1b",
        "enter" => "\r",
        "ctrl_enter" => "\n",
        "shift_enter" => "\x1b\r",
        "backspace" => "\x7f",
        "tab" => "\t",
        "shift_tab" => "\x1b[Z",
        "page_up" => "\x1b[5~",
        "page_down" => "\x1b[6~",
        "home" => "\x1b[H",
        "end" => "\x1b[F",
        "delete" => "\x1b[3~",
        "f1" => "\x1bOP",
        "f2" => "\x1bOQ",
        "f3" => "\x1bOR",
        "f4" => "\x1bOS",
        "f5" => "\x1b[15~",
        "f6" => "\x1b[17~",
        "f7" => "\x1b[18~",
        "f8" => "\x1b[19~",
        "f9" => "\x1b[20~",
        "f10" => "\x1b[21~",
        "f11" => "\x1b[23~",
        "f12" => "\x1b[24~",
        _ => return None,
    };
    Some(seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrows_and_function_keys_resolve() {
        assert_eq!(key_sequence("arrow_up"), Some("\x1b[A"));
        assert_eq!(key_sequence("f1"), Some("\x1bOP"));
        assert_eq!(key_sequence("f12"), Some("\x1b[24~"));
        assert_eq!(key_sequence("shift_tab"), Some("\x1b[Z"));
    }

    #[test]
    fn unknown_keys_are_none() {
        assert_eq!(key_sequence("hyper_meta_cokebottle"), None);
    }
}
