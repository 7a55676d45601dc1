// Integration tests for the 2Captcha client against an in-process mock of in.php / res.php

use actix_web::{dev::ServerHandle, web, App, HttpResponse, HttpServer, Responder};
use certidao_cli::captcha::{CaptchaError, CaptchaImage, Challenge, RemoteSolverClient};
use certidao_cli::config::RemoteConfig;
use image::{DynamicImage, GrayImage, Luma};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const API_KEY: &str = "test-key";

#[derive(Default)]
struct MockState {
    /// `CAPCHA_NOT_READY` answers before the job is solved; `u32::MAX` never solves.
    not_ready: u32,
    polls: AtomicU32,
    submissions: Mutex<Vec<HashMap<String, String>>>,
}

async fn in_handler(
    state: web::Data<Arc<MockState>>,
    form: web::Form<HashMap<String, String>>,
) -> impl Responder {
    let form = form.into_inner();
    let key_ok = form.get("key").map(String::as_str) == Some(API_KEY);
    state.submissions.lock().unwrap().push(form);

    if !key_ok {
        return HttpResponse::Ok().json(json!({ "status": 0, "request": "ERROR_WRONG_USER_KEY" }));
    }
    HttpResponse::Ok().json(json!({ "status": 1, "request": "4242" }))
}

async fn res_handler(
    state: web::Data<Arc<MockState>>,
    query: web::Query<HashMap<String, String>>,
) -> impl Responder {
    match query.get("action").map(String::as_str) {
        Some("getbalance") => HttpResponse::Ok().json(json!({ "status": 1, "request": "12.5" })),
        Some("get") if query.get("id").map(String::as_str) == Some("4242") => {
            let poll = state.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if poll <= state.not_ready {
                HttpResponse::Ok().json(json!({ "status": 0, "request": "CAPCHA_NOT_READY" }))
            } else {
                // legacy plain-text answer
                HttpResponse::Ok().body("OK|xYz12")
            }
        }
        _ => HttpResponse::Ok().json(json!({ "status": 0, "request": "ERROR_WRONG_CAPTCHA_ID" })),
    }
}

fn start_mock(state: Arc<MockState>) -> (String, ServerHandle) {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/in.php", web::post().to(in_handler))
            .route("/res.php", web::get().to(res_handler))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_rt::spawn(server);
    (format!("http://{}", addr), handle)
}

fn client_for(base_url: &str, api_key: &str, max_polls: u32) -> RemoteSolverClient {
    let config = RemoteConfig {
        base_url: base_url.to_string(),
        poll_interval: Duration::from_millis(10),
        max_polls,
        request_timeout: Duration::from_secs(5),
        ..RemoteConfig::new(api_key)
    };
    RemoteSolverClient::new(&config).unwrap()
}

fn sample_image() -> CaptchaImage {
    let gray = GrayImage::from_fn(30, 12, |x, _| Luma([if x % 3 == 0 { 0 } else { 255 }]));
    CaptchaImage::from_pixels(DynamicImage::ImageLuma8(gray)).unwrap()
}

#[actix_rt::test]
async fn test_image_solved_after_not_ready_polls() {
    let state = Arc::new(MockState {
        not_ready: 3,
        ..MockState::default()
    });
    let (base_url, handle) = start_mock(state.clone());
    let client = client_for(&base_url, API_KEY, 10);

    let answer = client.solve(&Challenge::image(&sample_image())).await.unwrap();

    assert_eq!(answer, "xYz12");
    assert_eq!(state.polls.load(Ordering::SeqCst), 4);

    let submissions = state.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].get("method").map(String::as_str), Some("base64"));
    assert_eq!(submissions[0].get("json").map(String::as_str), Some("1"));
    assert!(!submissions[0].get("body").unwrap().is_empty());
    drop(submissions);

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_never_ready_times_out_after_max_polls() {
    let state = Arc::new(MockState {
        not_ready: u32::MAX,
        ..MockState::default()
    });
    let (base_url, handle) = start_mock(state.clone());
    let client = client_for(&base_url, API_KEY, 5);

    let err = client
        .solve(&Challenge::image(&sample_image()))
        .await
        .unwrap_err();

    assert!(matches!(err, CaptchaError::NotReadyTimeout { polls: 5 }));
    assert_eq!(state.polls.load(Ordering::SeqCst), 5);

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_wrong_key_is_a_submission_error() {
    let state = Arc::new(MockState::default());
    let (base_url, handle) = start_mock(state.clone());
    let client = client_for(&base_url, "bad-key", 5);

    let err = client
        .solve(&Challenge::image(&sample_image()))
        .await
        .unwrap_err();

    match err {
        CaptchaError::SubmissionError(reason) => assert_eq!(reason, "ERROR_WRONG_USER_KEY"),
        other => panic!("expected a submission error, got {:?}", other),
    }
    assert_eq!(state.polls.load(Ordering::SeqCst), 0);

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_hcaptcha_token_fields() {
    let state = Arc::new(MockState::default());
    let (base_url, handle) = start_mock(state.clone());
    let client = client_for(&base_url, API_KEY, 5);

    let token = client
        .solve(&Challenge::HCaptcha {
            site_key: "10000000-ffff-ffff-ffff-000000000001".into(),
            page_url: "https://eprocesso.sit.trabalho.gov.br/Entrar".into(),
        })
        .await
        .unwrap();
    assert_eq!(token, "xYz12");

    let submissions = state.submissions.lock().unwrap();
    let form = &submissions[0];
    assert_eq!(form.get("method").map(String::as_str), Some("hcaptcha"));
    assert_eq!(
        form.get("sitekey").map(String::as_str),
        Some("10000000-ffff-ffff-ffff-000000000001")
    );
    assert_eq!(
        form.get("pageurl").map(String::as_str),
        Some("https://eprocesso.sit.trabalho.gov.br/Entrar")
    );
    drop(submissions);

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_balance() {
    let state = Arc::new(MockState::default());
    let (base_url, handle) = start_mock(state);
    let client = client_for(&base_url, API_KEY, 5);

    let balance = client.balance().await.unwrap();
    assert!((balance - 12.5).abs() < f64::EPSILON);

    handle.stop(true).await;
}

#[actix_rt::test]
async fn test_unreachable_service_is_attempt_level() {
    // nothing listens on port 9 of localhost
    let client = client_for("http://127.0.0.1:9", API_KEY, 5);

    let err = client
        .solve(&Challenge::image(&sample_image()))
        .await
        .unwrap_err();

    assert!(matches!(err, CaptchaError::SubmissionError(_)));
    assert!(err.is_attempt_level());
}
