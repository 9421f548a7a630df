//! UTF-8 safe string helpers.
//!
//! All helpers count Unicode scalar values (chars), never bytes, so they
//! cannot panic on multibyte characters.

/// Return the first `n` characters of `s` as a `String` (no ellipsis).
pub fn prefix_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Return a preview of `s` up to `n` characters. If `s` is longer than `n`
/// characters, the returned string will include a trailing ellipsis `...`.
pub fn preview(s: &str, n: usize) -> String {
    let mut prefix = prefix_chars(s, n);
    if s.chars().count() > n {
        prefix.push_str("...");
    }
    prefix
}

/// Keep the head and tail of `s` when it exceeds `max` characters, replacing
/// the middle with a marker that states how much was elided.
///
/// Command output is most useful at both ends: the command echo and first
/// lines at the top, the error and exit summary at the bottom.
pub fn clip_middle(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    let head_len = max / 2;
    let tail_len = max - head_len;
    let head: String = s.chars().take(head_len).collect();
    let tail: String = s.chars().skip(total - tail_len).collect();
    format!(
        "{}\n... [{} characters omitted] ...\n{}",
        head,
        total - head_len - tail_len,
        tail
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_basic_ascii() {
        let s = "hello world";
        assert_eq!(preview(s, 5), "hello...");
        assert_eq!(preview(s, 20), "hello world");
    }

    #[test]
    fn preview_multibyte_characters() {
        let s = "héllo wörld ünïcödé";
        let p = preview(s, 7);
        assert_eq!(p, "héllo w...");
    }

    #[test]
    fn clip_middle_short_is_unchanged() {
        assert_eq!(clip_middle("abc", 10), "abc");
    }

    #[test]
    fn clip_middle_keeps_both_ends() {
        let s = "0123456789abcdefghij";
        let clipped = clip_middle(s, 6);
        assert!(clipped.starts_with("012"));
        assert!(clipped.ends_with("hij"));
        assert!(clipped.contains("[14 characters omitted]"));
    }
}
