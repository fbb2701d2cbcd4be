use actix_upload::{
    handlers::{ChunkFlow, Flow, UploadHandler},
    test::FormBuilder,
    HandlerKind, Limits, UploadConfig, UploadError, UploadForm, UploadedFile,
};
use actix_web::{
    error::InternalError,
    http::{header, StatusCode},
    test, web, App, HttpResponse,
};

async fn summary(form: UploadForm) -> HttpResponse {
    let mut lines = Vec::new();

    for (name, value) in &form.fields {
        lines.push(format!("field {name}={value}"));
    }

    for (name, file) in &form.files {
        let storage = if file.is_in_memory() { "memory" } else { "disk" };
        lines.push(format!(
            "file {name}={} {} {storage}",
            file.name(),
            file.size()
        ));
    }

    HttpResponse::Ok().body(lines.join("\n"))
}

fn form_request(body: web::Bytes, headers: header::HeaderMap) -> test::TestRequest {
    let mut req = test::TestRequest::post().uri("/").set_payload(body);
    for (name, value) in headers.iter() {
        req = req.insert_header((name.clone(), value.clone()));
    }
    req
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[actix_web::test]
async fn default_config() {
    init_logger();

    let app = test::init_service(App::new().route("/", web::post().to(summary))).await;

    let (body, headers) = FormBuilder::new()
        .text("title", "holiday")
        .file(
            "photo",
            "beach.jpg",
            Some(mime::IMAGE_JPEG),
            vec![0xffu8; 4096].into(),
        )
        .build();

    let req = form_request(body, headers);

    let res = test::call_service(&app, req.to_request()).await;
    assert_eq!(res.status(), StatusCode::OK);

    let body = test::read_body(res).await;
    assert_eq!(
        body,
        "field title=holiday\nfile photo=beach.jpg 4096 memory"
    );
}

#[actix_web::test]
async fn configured_memory_size_spills() {
    init_logger();

    let dir = tempfile::tempdir().unwrap();

    let app = test::init_service(
        App::new()
            .app_data(
                UploadConfig::default()
                    .max_memory_size(16)
                    .temp_dir(dir.path()),
            )
            .route("/", web::post().to(summary)),
    )
    .await;

    let (body, headers) = FormBuilder::new()
        .file("small", "a.txt", None, "tiny".into())
        .file("big", "b.txt", None, "more than sixteen bytes".into())
        .build();

    let req = form_request(body, headers);

    let body = test::call_and_read_body(&app, req.to_request()).await;
    assert_eq!(
        body,
        "file small=a.txt 4 memory\nfile big=b.txt 23 disk"
    );

    // temporary files are gone once the form is dropped
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// Refuses files with a `.exe` extension.
struct RejectExecutables;

impl UploadHandler for RejectExecutables {
    fn new_file(&mut self, file: &actix_upload::handlers::FileInfo) -> Result<Flow, UploadError> {
        if file.file_name.ends_with(".exe") {
            return Ok(Flow::StopUpload {
                connection_reset: false,
            });
        }
        Ok(Flow::Continue)
    }

    fn receive_data_chunk(&mut self, data: web::Bytes, _: u64) -> Result<ChunkFlow, UploadError> {
        Ok(ChunkFlow::Forward(data))
    }

    fn file_complete(&mut self, _: u64) -> Result<Option<UploadedFile>, UploadError> {
        Ok(None)
    }
}

#[actix_web::test]
async fn custom_handler_and_error_handler() {
    init_logger();

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(
                UploadConfig::default()
                    .handlers(vec![
                        HandlerKind::custom(|_: &UploadConfig| RejectExecutables),
                        HandlerKind::Memory,
                        HandlerKind::TemporaryFile,
                    ])
                    .error_handler(|err, _req| {
                        let status = match err {
                            UploadError::UploadStopped { .. } => StatusCode::FORBIDDEN,
                            _ => StatusCode::BAD_REQUEST,
                        };
                        InternalError::new(err, status).into()
                    }),
            ))
            .route("/", web::post().to(summary)),
    )
    .await;

    let (body, headers) = FormBuilder::new()
        .file("doc", "notes.txt", None, "fine".into())
        .build();
    let req = form_request(body, headers);
    let res = test::call_service(&app, req.to_request()).await;
    assert_eq!(res.status(), StatusCode::OK);

    let (body, headers) = FormBuilder::new()
        .file("doc", "setup.exe", None, "MZ".into())
        .build();
    let req = form_request(body, headers);
    let res = test::call_service(&app, req.to_request()).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[actix_web::test]
async fn bad_requests() {
    init_logger();

    let app = test::init_service(
        App::new()
            .app_data(UploadConfig::default().limits(Limits {
                max_field_memory: Some(8),
                ..Limits::default()
            }))
            .route("/", web::post().to(summary)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/")
        .insert_header((header::CONTENT_TYPE, "application/json"))
        .set_payload("{}")
        .to_request();
    let res = test::call_service(&app, req).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let (body, headers) = FormBuilder::new()
        .text("essay", "far too long for the limit")
        .build();
    let req = form_request(body, headers);
    let res = test::call_service(&app, req.to_request()).await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
