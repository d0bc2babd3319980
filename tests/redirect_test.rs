mod common;

use common::{ok, redirect, request_body, request_method, request_path, serve};
use http::{Method, StatusCode};
use muxnet::http::requestbody::RequestBody;
use muxnet::http::response::HttpResponse;
use muxnet::urlrequest::{
    RedirectDecision, Request, Session, SessionConfig, Task, TaskDelegate,
};
use muxnet::NetError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_redirect_chain_is_followed() {
    let base = serve(|request| match request_path(&request) {
        "/a" => redirect("302 Found", "/b"),
        "/b" => redirect("301 Moved Permanently", "c"),
        "/c" => ok("done"),
        _ => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
    })
    .await;

    let session = Session::new(SessionConfig::default());
    let task = session.data_task_with_url(&format!("{}/a", base)).unwrap();
    task.resume();
    task.wait().await.unwrap();

    assert_eq!(task.text().unwrap(), "done");
    assert_eq!(task.original_request().url().path(), "/a");
    assert_eq!(task.current_request().url().path(), "/c");
    let response = task.response().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.url().path(), "/c");
}

#[tokio::test]
async fn test_redirect_limit() {
    let base = serve(|_| redirect("302 Found", "/loop")).await;

    let session = Session::new(SessionConfig::default().with_max_redirects(3));
    let task = session
        .data_task_with_url(&format!("{}/start", base))
        .unwrap();
    task.resume();
    assert_eq!(task.wait().await, Err(NetError::TooManyRedirects));
}

struct Decliner {
    redirects: AtomicUsize,
}

impl TaskDelegate for Decliner {
    fn will_perform_redirect(
        &self,
        _task: &Task,
        response: &HttpResponse,
        new_request: &Request,
        decision: RedirectDecision,
    ) {
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(new_request.url().path(), "/next");
        self.redirects.fetch_add(1, Ordering::SeqCst);
        decision.decline();
    }
}

#[tokio::test]
async fn test_declined_redirect_completes_with_redirect_response() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let base = serve(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        redirect("302 Found", "/next")
    })
    .await;

    let delegate = Arc::new(Decliner {
        redirects: AtomicUsize::new(0),
    });
    let session = Session::with_delegate(SessionConfig::default(), delegate.clone());
    let task = session.data_task_with_url(&base).unwrap();
    task.resume();
    task.wait().await.unwrap();

    assert_eq!(task.response().unwrap().status(), StatusCode::FOUND);
    assert_eq!(delegate.redirects.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

struct Rewriter;

impl TaskDelegate for Rewriter {
    fn will_perform_redirect(
        &self,
        _task: &Task,
        _response: &HttpResponse,
        new_request: &Request,
        decision: RedirectDecision,
    ) {
        let target = new_request.url().join("/elsewhere").unwrap();
        let answer = Request::new(target);
        // Answer from another task to exercise asynchronous decisions
        tokio::spawn(async move { decision.follow(answer) });
    }
}

#[tokio::test]
async fn test_delegate_rewrites_redirect() {
    let base = serve(|request| match request_path(&request) {
        "/elsewhere" => ok("rewritten"),
        _ => redirect("307 Temporary Redirect", "/proposed"),
    })
    .await;

    let session = Session::with_delegate(SessionConfig::default(), Arc::new(Rewriter));
    let task = session.data_task_with_url(&base).unwrap();
    task.resume();
    task.wait().await.unwrap();

    assert_eq!(task.text().unwrap(), "rewritten");
    assert_eq!(task.current_request().url().path(), "/elsewhere");
}

#[tokio::test]
async fn test_303_turns_post_into_get() {
    let base = serve(|request| match request_path(&request) {
        "/form" => redirect("303 See Other", "/result"),
        _ => ok(&format!(
            "{} [{}]",
            request_method(&request),
            request_body(&request)
        )),
    })
    .await;

    let session = Session::new(SessionConfig::default());
    let request = Request::parse(&format!("{}/form", base))
        .unwrap()
        .with_method(Method::POST)
        .with_header("Content-Type", "text/plain")
        .unwrap();
    let task = session.upload_task(request, "fields").unwrap();
    task.resume();
    task.wait().await.unwrap();

    assert_eq!(task.text().unwrap(), "GET []");
    assert_eq!(task.current_request().method(), Method::GET);
}

#[tokio::test]
async fn test_307_replays_body() {
    let base = serve(|request| match request_path(&request) {
        "/upload" => redirect("307 Temporary Redirect", "/again"),
        _ => ok(&format!(
            "{} {}",
            request_method(&request),
            request_body(&request)
        )),
    })
    .await;

    let session = Session::new(SessionConfig::default());
    let request = Request::parse(&format!("{}/upload", base))
        .unwrap()
        .with_method(Method::PUT);
    let task = session.upload_task(request, "replayed").unwrap();
    task.resume();
    task.wait().await.unwrap();

    assert_eq!(task.text().unwrap(), "PUT replayed");
    assert_eq!(task.bytes_sent(), 8);
}

#[tokio::test]
async fn test_307_with_stream_body_fails() {
    let base = serve(|_| redirect("307 Temporary Redirect", "/again")).await;

    let session = Session::new(SessionConfig::default());
    let (sender, body) = RequestBody::stream();
    sender.send("once").unwrap();
    drop(sender);
    let request = Request::parse(&base)
        .unwrap()
        .with_method(Method::POST)
        .with_body(body);
    let task = session.data_task(request).unwrap();
    task.resume();

    assert_eq!(
        task.wait().await,
        Err(NetError::UploadStreamRewindNotSupported)
    );
}

#[tokio::test]
async fn test_unsafe_redirect_target() {
    let base = serve(|_| redirect("302 Found", "ftp://example.com/file")).await;

    let session = Session::new(SessionConfig::default());
    let task = session.data_task_with_url(&base).unwrap();
    task.resume();
    assert_eq!(task.wait().await, Err(NetError::UnsafeRedirect));
}
