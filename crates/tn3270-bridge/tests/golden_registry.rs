// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Golden screen registry tests
//!
//! Layout signatures taken from live fake-host screens, persistence across
//! registry instances, and field-level mismatch reports.

mod common;

use common::Harness;
use tn3270_bridge::golden::{Comparison, FieldDiff, GoldenRegistry, LayoutSignature};
use tn3270_bridge::session::SessionHandle;
use tn3270_bridge::{Cursor, ErrorCode, Field, Screen};
use tn3270_bridge_fixtures::HostBehavior;

fn capture(harness: &Harness, handle: &SessionHandle) -> Screen {
    harness
        .executor
        .read_screen(handle, None)
        .unwrap()
        .screen_after
        .unwrap()
}

fn connected() -> (Harness, SessionHandle) {
    let harness = Harness::new(HostBehavior::default());
    let handle = harness.executor.connect(None, None).unwrap();
    (harness, handle)
}

// =============================================================================
// Signatures
// =============================================================================

#[test]
fn typed_input_keeps_the_signature() {
    let (harness, handle) = connected();
    let before = capture(&harness, &handle);
    harness
        .executor
        .fill_by_label(&handle, "Logon ===>", "HERC02", 1, None)
        .unwrap();
    let after = capture(&harness, &handle);

    assert_ne!(before.content_digest(), after.content_digest());
    assert_eq!(LayoutSignature::of(&before), LayoutSignature::of(&after));
    assert_eq!(
        LayoutSignature::of(&before).digest(),
        LayoutSignature::of(&after).digest()
    );
}

#[test]
fn cursor_and_lock_state_are_not_part_of_the_layout() {
    let fields = || vec![Field::new(0, 1, 10, true, "Logon ===>")];
    let a = Screen::from_fields(24, 80, fields(), Cursor::default(), false);
    let b = Screen::from_fields(24, 80, fields(), Cursor { row: 5, col: 7 }, true);
    assert_eq!(LayoutSignature::of(&a).digest(), LayoutSignature::of(&b).digest());
}

// =============================================================================
// Registry
// =============================================================================

#[test]
fn next_panel_is_a_mismatch_naming_the_field() {
    let (harness, handle) = connected();
    let registry = GoldenRegistry::new();
    registry.save("logon", &capture(&harness, &handle)).unwrap();

    harness
        .executor
        .fill_by_label(&handle, "Logon ===>", "HERC02", 1, None)
        .unwrap();
    assert_eq!(
        registry.compare("logon", &capture(&harness, &handle)).unwrap(),
        Comparison::Match
    );

    harness.executor.press(&handle, "Enter", None).unwrap();
    let Comparison::Mismatch { diffs } = registry
        .compare("logon", &capture(&harness, &handle))
        .unwrap()
    else {
        panic!("password panel must not match the logon golden");
    };
    assert!(
        diffs.iter().any(|diff| matches!(
            diff,
            FieldDiff::Changed { index: 0, expected, actual }
                if expected.length == 10 && actual.length == 13
        )),
        "{diffs:?}"
    );
}

#[test]
fn unknown_golden_is_an_error() {
    let (harness, handle) = connected();
    let registry = GoldenRegistry::new();
    let err = registry
        .compare("missing", &capture(&harness, &handle))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Golden);
}

#[test]
fn persisted_goldens_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (harness, handle) = connected();
    let screen = capture(&harness, &handle);

    {
        let registry = GoldenRegistry::open(dir.path()).unwrap();
        registry.save("logon", &screen).unwrap();
        registry.save("scratch", &screen).unwrap();
        assert!(registry.remove("scratch").unwrap());
        assert!(!registry.remove("scratch").unwrap());
    }
    assert!(dir.path().join("logon.json").exists());
    assert!(!dir.path().join("scratch.json").exists());

    let reopened = GoldenRegistry::open(dir.path()).unwrap();
    assert_eq!(reopened.list(), vec!["logon".to_string()]);
    let entry = reopened.get("logon").unwrap();
    assert_eq!(entry.signature, LayoutSignature::of(&screen));
    assert!(entry.lines[0].contains("Logon ===>"));
    assert!(reopened.compare("logon", &screen).unwrap().is_match());
}

#[test]
fn path_like_names_are_rejected() {
    let (harness, handle) = connected();
    let registry = GoldenRegistry::new();
    let screen = capture(&harness, &handle);
    for name in ["../escape", "a/b", ".hidden"] {
        let err = registry.save(name, &screen).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation, "{name}");
    }
    assert!(registry.list().is_empty());
}
