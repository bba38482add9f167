//! Auth file lookup and write behavior

use rcon::registry::auth::{AuthError, AuthFileHelper, Keychain};
use std::fs;
use std::os::unix::fs::PermissionsExt;

fn write_auth_file(dir: &std::path::Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("auth.json");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn exact_reference_wins_over_domain_and_default() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_auth_file(
        tmp.path(),
        r#"{
            "example.com/private:1": {"username": "exact", "secret": "a"},
            "example.com": {"username": "domain", "secret": "b"},
            "default": {"username": "fallback", "secret": "c"}
        }"#,
    );
    let helper = AuthFileHelper::new(&path);

    assert_eq!(helper.get("example.com/private:1").unwrap().username, "exact");
    assert_eq!(helper.get("example.com/other:2").unwrap().username, "domain");
    assert_eq!(helper.get("elsewhere.io/app").unwrap().username, "fallback");
}

#[test]
fn domain_matching_strips_scheme_and_port() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_auth_file(
        tmp.path(),
        r#"{"example.com": {"username": "domain", "secret": "b"}}"#,
    );
    let helper = AuthFileHelper::new(&path);

    assert_eq!(
        helper.get("https://example.com/v2/app").unwrap().username,
        "domain"
    );
    assert_eq!(helper.get("example.com:443/app").unwrap().username, "domain");
}

#[test]
fn missing_entry_reports_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_auth_file(tmp.path(), r#"{}"#);
    let helper = AuthFileHelper::new(&path);

    assert!(matches!(
        helper.get("nowhere.dev/app"),
        Err(AuthError::NotFound(_))
    ));
    // the keychain view treats that as an anonymous pull, not an error
    assert!(helper.resolve("nowhere.dev/app").is_none());
}

#[test]
fn add_creates_the_file_with_restrictive_mode() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("auth.json");
    let helper = AuthFileHelper::new(&path);

    helper.add("example.com", "alice", "s3cret").unwrap();

    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    assert_eq!(helper.get("example.com").unwrap().username, "alice");
}

#[test]
fn add_merges_with_existing_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("auth.json");
    let helper = AuthFileHelper::new(&path);

    helper.add("one.example", "alice", "a").unwrap();
    helper.add("two.example", "bob", "b").unwrap();
    // overwriting an entry replaces only that entry
    helper.add("one.example", "alice2", "a2").unwrap();

    assert_eq!(helper.get("one.example").unwrap().username, "alice2");
    assert_eq!(helper.get("two.example").unwrap().username, "bob");
}
