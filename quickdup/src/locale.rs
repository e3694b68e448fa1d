//! Label of the injected control in the host's UI language

const LABELS: &[(&str, &str)] = &[
    ("de", "Termin duplizieren"),
    ("en", "Duplicate event"),
    ("es", "Duplicar evento"),
    ("fr", "Dupliquer l'événement"),
    ("it", "Duplica evento"),
    ("pt", "Duplicar evento"),
    ("nl", "Evenement dupliceren"),
    ("pl", "Duplikuj wydarzenie"),
    ("tr", "Etkinliği çoğalt"),
    ("uk", "Дублювати подію"),
];

const FALLBACK: &str = "Duplicate event";

/// Resolve by full tag, then base language, then English.
pub fn duplicate_label(language: Option<&str>) -> &'static str {
    let Some(tag) = language else {
        return FALLBACK;
    };
    let tag = tag.trim().to_lowercase().replace('_', "-");
    let base = tag.split('-').next().unwrap_or_default();
    LABELS
        .iter()
        .find(|(lang, _)| *lang == tag)
        .or_else(|| LABELS.iter().find(|(lang, _)| *lang == base))
        .map(|(_, label)| *label)
        .unwrap_or(FALLBACK)
}
