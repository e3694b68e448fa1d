//! Markup of the injected duplicate control

use uuid::Uuid;

use crate::host::ControlInfo;

const ICON_SVG: &str = r#"<svg height="20" viewBox="0 0 24 24" width="20" focusable="false"><path d="M0 0h24v24H0V0z" fill="none"></path><path d="M16 1H4c-1.1 0-2 .9-2 2v14h2V3h12V1zm-1 4H8c-1.1 0-1.99.9-1.99 2L6 21c0 1.1.89 2 1.99 2H19c1.1 0 2-.9 2-2V11l-6-6zM8 21V7h6v5h5v9H8z"></path></svg>"#;

/// Visual variant copied from whatever the host currently renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTemplate {
    pub button_class: String,
    pub include_spacer: bool,
}

impl ControlTemplate {
    /// Copy the class of the first labeled control that is not ours and not
    /// labeled like ours. Without one, fall back to the structural default.
    pub fn adapt(
        controls: &[ControlInfo],
        own_label: &str,
        fallback_class: &str,
        panel_has_spacer: bool,
    ) -> Self {
        let reference = controls.iter().find(|c| {
            !c.inside_custom
                && c.aria_label
                    .as_deref()
                    .is_some_and(|label| !label.is_empty() && label != own_label)
        });
        match reference {
            Some(reference) => {
                let class = reference.class_name.trim();
                Self {
                    button_class: if class.is_empty() {
                        fallback_class.to_string()
                    } else {
                        class.to_string()
                    },
                    include_spacer: reference.preceded_by_spacer || panel_has_spacer,
                }
            }
            None => Self {
                button_class: fallback_class.to_string(),
                include_spacer: panel_has_spacer,
            },
        }
    }
}

pub fn render_control(
    template: &ControlTemplate,
    wrapper_class: &str,
    spacer_class: &str,
    item_id: Option<&str>,
    label: &str,
) -> String {
    let tooltip_id = format!("tt-dup-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let spacer = if template.include_spacer {
        format!(r#"<div class="{}"></div>"#, escape(spacer_class))
    } else {
        String::new()
    };
    let label = escape(label);
    format!(
        concat!(
            r#"<div class="{wrapper}" data-id="{id}">{spacer}"#,
            r#"<span data-is-tooltip-wrapper="true">"#,
            r#"<button type="button" class="{class}" data-tooltip-enabled="true" data-tooltip-id="{tooltip}" aria-label="{label}">"#,
            r#"<span aria-hidden="true">{icon}</span></button>"#,
            r#"<div role="tooltip" aria-hidden="true" id="{tooltip}">{label}</div>"#,
            r#"</span></div>"#
        ),
        wrapper = escape(wrapper_class),
        id = escape(item_id.unwrap_or_default()),
        spacer = spacer,
        class = escape(&template.button_class),
        tooltip = tooltip_id,
        label = label,
        icon = ICON_SVG,
    )
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
