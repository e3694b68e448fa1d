use quickdup::{build_target_location, parse_mode_and_date, LocationRules, ViewContext};

#[test]
fn round_trip_through_a_duplicate_editor() {
    let rules = LocationRules::default();
    let original = "https://calendar.google.com/calendar/u/2/r/month/2025/1/31";

    let ctx = ViewContext::from_location(original, &rules);
    assert_eq!(ctx.mode.as_deref(), Some("month"));
    assert_eq!(ctx.date_token.as_ref().map(|d| d.as_str()), Some("20250131"));
    assert_eq!(build_target_location(&ctx, &rules), original);

    let mut from_editor = ViewContext::from_location(
        "https://calendar.google.com/calendar/u/2/r/eventedit/duplicate/abc",
        &rules,
    );
    from_editor.mode = ctx.mode.clone();
    from_editor.date_token = ctx.date_token.clone();
    assert_eq!(
        build_target_location(&from_editor, &rules),
        "https://calendar.google.com/calendar/u/2/r/month/2025/1/31"
    );
}

#[test]
fn custom_rules_are_honoured() {
    let rules = LocationRules {
        reserved_segment: "view".to_string(),
        default_prefix: "/app".to_string(),
        transient_markers: vec!["edit".to_string()],
    };
    let parsed = parse_mode_and_date("https://example.test/app/view/agenda/2024/7/4", &rules);
    assert_eq!(parsed.mode.as_deref(), Some("agenda"));
    assert_eq!(parsed.date_token.unwrap().as_str(), "20240704");

    let mut ctx = ViewContext::from_location("https://example.test/edit/1", &rules);
    ctx.mode = Some("agenda".to_string());
    assert_eq!(
        build_target_location(&ctx, &rules),
        "https://example.test/app/view/agenda"
    );
}

#[test]
fn reserved_segment_at_root_has_empty_prefix() {
    let rules = LocationRules::default();
    let mut ctx = ViewContext::from_location("https://h.test/r/eventedit/x", &rules);
    ctx.mode = Some("week".to_string());
    assert_eq!(build_target_location(&ctx, &rules), "https://h.test/r/week");
}

#[test]
fn target_location_is_stable_under_rebuilding() {
    let rules = LocationRules::default();
    let parsed = parse_mode_and_date(
        "https://calendar.google.com/calendar/u/0/r/week/2025/2/18",
        &rules,
    );
    assert_eq!(parsed.mode.as_deref(), Some("week"));
    assert_eq!(parsed.date_token.as_ref().map(|d| d.as_str()), Some("20250218"));

    let mut ctx = ViewContext::from_location(
        "https://calendar.google.com/calendar/u/0/r/eventedit/duplicate/abc",
        &rules,
    );
    ctx.mode = parsed.mode;
    ctx.date_token = parsed.date_token;
    let target = build_target_location(&ctx, &rules);
    assert_eq!(target, "https://calendar.google.com/calendar/u/0/r/week/2025/2/18");

    let again = ViewContext::from_location(&target, &rules);
    assert_eq!(build_target_location(&again, &rules), target);
}
