use crate::delivery::chunker::is_fence_line;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$[ \t]*(\d+(?:,\d{3})*(?:\.\d+)?)").expect("currency pattern is valid")
});

/// Wraps `$` figures in inline-code backticks and drops any space between the
/// sign and the number. Figures already inside an inline span only get the
/// space collapsed; fenced blocks are left alone.
pub fn normalize_currency(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_fence = false;
    for line in text.split_inclusive('\n') {
        if is_fence_line(line) {
            in_fence = !in_fence;
            out.push_str(line);
            continue;
        }
        if in_fence {
            out.push_str(line);
            continue;
        }

        let replaced = CURRENCY.replace_all(line, |caps: &Captures| {
            let whole = caps.get(0).map_or(0, |m| m.start());
            let number = &caps[1];
            let backticks_before = line[..whole].matches('`').count();
            if backticks_before % 2 == 1 {
                format!("${number}")
            } else {
                format!("`${number}`")
            }
        });
        out.push_str(&replaced);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_bare_figures_and_collapses_space() {
        assert_eq!(
            normalize_currency("Entry Price: $ 65,123.45 then $70000"),
            "Entry Price: `$65,123.45` then `$70000`"
        );
    }

    #[test]
    fn leaves_wrapped_figures_alone() {
        let text = "• Stop Loss: `$61,000.00`\n• TP 1: `$ 68,500`\n";
        assert_eq!(
            normalize_currency(text),
            "• Stop Loss: `$61,000.00`\n• TP 1: `$68,500`\n"
        );
    }

    #[test]
    fn does_not_swallow_trailing_punctuation() {
        assert_eq!(
            normalize_currency("support at $1,250, resistance at $1,400."),
            "support at `$1,250`, resistance at `$1,400`."
        );
    }

    #[test]
    fn skips_fenced_blocks() {
        let text = "```\nprice = $ 5\n```\nnow $ 5\n";
        assert_eq!(normalize_currency(text), "```\nprice = $ 5\n```\nnow `$5`\n");
    }

    #[test]
    fn ignores_dollar_without_number() {
        assert_eq!(normalize_currency("$[harga] and US$"), "$[harga] and US$");
    }
}
