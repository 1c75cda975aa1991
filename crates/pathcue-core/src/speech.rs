use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new("<[^<]+?>").expect("literal tag pattern"));

/// Remove markup tags (`<b>`, `<div style="...">`) so the text can be spoken.
pub fn strip_markup(text: &str) -> String {
    TAG.replace_all(text, "").into_owned()
}
