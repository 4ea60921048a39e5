//! Integration test: the global enable flag gates recording, and graphs
//! collected before a disable stay dumpable.

use serde_json::Value;
use serial_test::serial;

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    scopetrace::enable();
}

fn dump() -> Value {
    serde_json::from_str(&scopetrace::dump_json().expect("dump should succeed"))
        .expect("dump output should be valid JSON")
}

fn tags_in(doc: &Value) -> Vec<String> {
    let mut tags = Vec::new();
    for thread in doc["threads"].as_array().expect("threads array") {
        for node in thread["graph"]["nodes"].as_array().expect("nodes array") {
            tags.push(node["tag"].as_str().unwrap_or_default().to_owned());
        }
    }
    tags
}

#[test]
#[serial]
fn scopes_while_disabled_leave_no_trace() {
    setup();
    {
        scopetrace::trace_scope!("toggle_before");
    }

    scopetrace::disable();
    assert!(!scopetrace::is_enabled());
    {
        scopetrace::trace_scope!("toggle_hidden");
    }

    scopetrace::enable();
    {
        scopetrace::trace_scope!("toggle_after");
    }

    let tags = tags_in(&dump());
    assert!(tags.iter().any(|t| t == "toggle_before"));
    assert!(tags.iter().any(|t| t == "toggle_after"));
    assert!(
        !tags.iter().any(|t| t == "toggle_hidden"),
        "scopes entered while disabled must not appear in the graph"
    );
}

#[test]
#[serial]
fn disable_between_begin_and_end_drops_the_interval() {
    setup();
    scopetrace::begin_scope("toggle_torn", scopetrace::here!());
    scopetrace::disable();
    // The exit is skipped symmetrically with the skipped recording, so the
    // stack must not underflow and later scopes must still balance.
    scopetrace::end_scope();
    scopetrace::enable();

    {
        scopetrace::trace_scope!("toggle_balanced");
    }

    let doc = dump();
    let tags = tags_in(&doc);
    assert!(tags.iter().any(|t| t == "toggle_balanced"));

    // The torn edge was opened but never closed; it must survive as an
    // in-flight edge rather than corrupting the stack.
    let balanced_completed = doc["threads"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|t| t["graph"]["edges"].as_array().unwrap().iter())
        .any(|e| e["completed"] == true);
    assert!(balanced_completed);
}

#[test]
#[serial]
fn dump_without_initialization_reports_not_initialized() {
    // This binary shares one process; if another test already installed the
    // registry the error cannot be provoked, so only check the variant when
    // nothing is installed yet.
    if scopetrace::ProcessContext::installed().is_none() {
        let err = scopetrace::dump_json().unwrap_err();
        assert!(matches!(err, scopetrace::Error::NotInitialized));
    }
}
