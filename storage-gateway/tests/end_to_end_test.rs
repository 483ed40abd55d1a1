mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::TestApp;

#[tokio::test]
async fn invite_signup_login_upload_list_delete() {
    let app = TestApp::spawn();
    app.seed_invite("ABC12345").await;

    // Registration consumes the invite
    let signup = app.signup("alice", "p@ss", "ABC12345").await;
    assert_eq!(signup.status, StatusCode::CREATED);

    let second = app.signup("bob", "p@ss", "ABC12345").await;
    assert_eq!(second.status, StatusCode::FORBIDDEN);

    let login = app.login("alice", "p@ss").await;
    assert_eq!(login.status, StatusCode::OK);
    let token = login.body["token"].as_str().unwrap().to_string();

    let content = b"%PDF-1.7 quarterly numbers".to_vec();
    let upload = app.upload("/upload", &token, "report.pdf", &content).await;
    assert_eq!(upload.status, StatusCode::OK);
    assert_eq!(upload.body["name"], "report.pdf");

    let listing = app.get_authed("/files", &token).await;
    assert_eq!(listing.status, StatusCode::OK);
    let entry = listing
        .body
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["name"] == "report.pdf")
        .expect("uploaded file should be listed")
        .clone();
    assert_eq!(entry["size"], content.len());

    // The listed URL grants read access for its validity window only
    let url = entry["url"].as_str().unwrap();
    let fetched = app
        .objects
        .fetch_signed(&app.signer, url, Utc::now())
        .unwrap();
    assert_eq!(fetched.unwrap(), content);
    assert!(app
        .objects
        .fetch_signed(&app.signer, url, Utc::now() + Duration::hours(2))
        .is_err());

    let delete = app.delete_authed("/files/report.pdf", &token).await;
    assert_eq!(delete.status, StatusCode::OK);

    let listing = app.get_authed("/files", &token).await;
    assert!(listing
        .body
        .as_array()
        .unwrap()
        .iter()
        .all(|f| f["name"] != "report.pdf"));

    // Object is gone, so the old URL still verifies but serves nothing
    assert!(app
        .objects
        .fetch_signed(&app.signer, url, Utc::now())
        .unwrap()
        .is_none());
}
