//! Tests for the HTTP collaborators against a mock platform.
//!
//! Tests cover:
//! - Profile and posting lookups through the response envelope
//! - 404 mapped to absent records
//! - Submission status classification and receipts
//! - Bearer authentication and the similarity service

use autoapply_core::collaborators::{
    ApplicationSubmitter, HttpSimilarityModel, JobCatalog, ProfileDirectory, PlatformClient, SimilarityModel,
    SubmissionRequest,
};
use autoapply_core::error::ErrorCode;
use autoapply_core::jobs::ErrorType;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> PlatformClient {
    PlatformClient::new(&server.uri(), Some("secret".into()), Duration::from_secs(2)).unwrap()
}

fn request() -> SubmissionRequest {
    SubmissionRequest {
        auto_apply_job_id: Uuid::new_v4(),
        user_id: "u-1".into(),
        posting_id: "job-1".into(),
        resume_id: Some("resume-1".into()),
        cover_letter_id: None,
        generate_cover_letter: true,
        attempt: 1,
    }
}

// ============================================================================
// Lookups
// ============================================================================

#[tokio::test]
async fn test_profile_lookup_unwraps_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/internal/profiles/u-1"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "user_id": "u-1",
                "skills": ["python", "sql"],
                "years_experience": 4.0,
                "seniority": "senior",
                "summary": null,
                "default_resume_id": "resume-1",
                "default_cover_letter_id": null
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let profile = client(&server).profile("u-1").await.unwrap().unwrap();
    assert_eq!(profile.skills, vec!["python", "sql"]);
    assert_eq!(profile.default_resume_id.as_deref(), Some("resume-1"));
}

#[tokio::test]
async fn test_missing_posting_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/internal/jobs/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(client(&server).posting("gone").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unsuccessful_envelope_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/internal/jobs/job-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "data": null,
            "error": "catalog offline"
        })))
        .mount(&server)
        .await;

    let err = client(&server).posting("job-1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExternalServiceError);
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_submission_returns_receipt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/internal/applications/submit"))
        .and(body_partial_json(json!({ "posting_id": "job-1", "attempt": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "application_reference": "greenhouse-42",
                "submitted_at": "2026-03-02T10:00:00Z"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = client(&server).submit(&request()).await.unwrap();
    assert_eq!(receipt.application_reference.as_deref(), Some("greenhouse-42"));
}

#[tokio::test]
async fn test_submission_status_is_classified() {
    let cases = [
        (429, ErrorType::RateLimit),
        (503, ErrorType::Network),
        (410, ErrorType::JobClosed),
        (403, ErrorType::TosViolation),
        (422, ErrorType::Validation),
    ];

    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/applications/submit"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = client(&server).submit(&request()).await.unwrap_err();
        assert_eq!(err.error_type, expected, "status {}", status);
        assert!(err.message.contains(&status.to_string()));
    }
}

#[tokio::test]
async fn test_slow_submission_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/internal/applications/submit"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = PlatformClient::new(&server.uri(), None, Duration::from_millis(50)).unwrap();
    let err = client.submit(&request()).await.unwrap_err();
    assert_eq!(err.error_type, ErrorType::Timeout);
}

#[tokio::test]
async fn test_unreachable_platform_is_a_network_error() {
    let client = PlatformClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
    let err = client.submit(&request()).await.unwrap_err();
    assert_eq!(err.error_type, ErrorType::Network);
}

// ============================================================================
// Similarity
// ============================================================================

#[tokio::test]
async fn test_similarity_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/similarity"))
        .and(body_partial_json(json!({ "a": "resume text", "b": "job text" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "similarity": 0.6 })))
        .mount(&server)
        .await;

    let model = HttpSimilarityModel::new(&server.uri(), None, Duration::from_secs(2)).unwrap();
    let value = model.similarity("resume text", "job text").await.unwrap();
    assert!((value - 0.6).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_similarity_service_failure_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/similarity"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let model = HttpSimilarityModel::new(&server.uri(), None, Duration::from_secs(2)).unwrap();
    assert!(model.similarity("a", "b").await.is_err());
}
