//! Extraction of structured values from generated valuation reports.
use crate::model::Valuation;
use once_cell::sync::Lazy;
use regex::Regex;

// A label starts a line (after an optional quote or bullet) or follows an
// inline separator. Emphasis is allowed on either side of the colon, then an
// optional currency marker and the figure.
static VALUE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)(?:^[ \t>]*(?:[-*+•][ \t]+)?|[|;,:][ \t]*|[ \t]{2,})(?:\*\*|__)?[ \t]*(low|mid|medium|median|high)(?:[ \t]+(?:estimate|value))?[ \t]*(?:\*\*|__)?[ \t]*:[ \t]*(?:\*\*|__)?[ \t]*(?:US)?\$?[ \t]*([0-9](?:[0-9]|,[0-9])*(?:\.[0-9]+)?)",
    )
    .unwrap()
});

// Markdown table row: `| Low | $1,200 |`.
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)\|[ \t]*(?:\*\*|__)?[ \t]*(low|mid|medium|median|high)(?:[ \t]+(?:estimate|value))?[ \t]*(?:\*\*|__)?[ \t]*\|[ \t]*(?:\*\*|__)?[ \t]*(?:US)?\$?[ \t]*([0-9](?:[0-9]|,[0-9])*(?:\.[0-9]+)?)",
    )
    .unwrap()
});

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse().ok()
}

/// Pull the low/mid/high estimate out of a report. The first occurrence of
/// each label wins; labels that never appear stay `None`.
pub fn parse_valuation(text: &str) -> Valuation {
    let mut found: Vec<(usize, String, f64)> = Vec::new();
    for re in [&*VALUE_LINE, &*TABLE_ROW] {
        for caps in re.captures_iter(text) {
            let Some(amount) = caps.get(2).and_then(|m| parse_amount(m.as_str())) else {
                continue;
            };
            let label = &caps[1];
            let start = caps.get(1).map_or(0, |m| m.start());
            found.push((start, label.to_ascii_lowercase(), amount));
        }
    }
    found.sort_by_key(|(start, _, _)| *start);

    let mut v = Valuation::default();
    for (_, label, amount) in found {
        let slot = match label.as_str() {
            "low" => &mut v.low,
            "high" => &mut v.high,
            _ => &mut v.mid,
        };
        if slot.is_none() {
            *slot = Some(amount);
        }
    }
    v
}

/// Required section titles that do not appear anywhere in the report.
pub fn missing_sections(text: &str, required: &[String]) -> Vec<String> {
    let haystack = text.to_lowercase();
    required
        .iter()
        .filter(|s| !haystack.contains(&s.to_lowercase()))
        .cloned()
        .collect()
}
