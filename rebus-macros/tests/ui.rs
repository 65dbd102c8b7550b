#[test]
fn ui() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/event_basic.rs");
    t.pass("tests/ui/event_named.rs");
    t.pass("tests/ui/event_existing_fields.rs");
}
