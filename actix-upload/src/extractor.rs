//! Extractor for parsed uploads.

use actix_web::{dev, Error, FromRequest, HttpRequest};
use futures_core::future::LocalBoxFuture;
use futures_util::future::{ready, FutureExt as _, TryFutureExt as _};

use crate::{
    config::UploadConfig,
    map::{FieldMap, FileMap},
    parser::MultipartParser,
};

/// Plain fields and uploaded files of a `multipart/form-data` request.
///
/// The handler chain and limits are taken from the [`UploadConfig`] in app data, if any.
///
/// # Examples
///
/// ```
/// use actix_upload::UploadForm;
/// use actix_web::{post, HttpResponse, Responder};
///
/// #[post("/upload")]
/// async fn upload(form: UploadForm) -> impl Responder {
///     let mut names = Vec::new();
///
///     for (_, file) in &form.files {
///         names.push(format!("{} ({} bytes)", file.name(), file.size()));
///     }
///
///     HttpResponse::Ok().body(names.join("\n"))
/// }
/// ```
#[derive(Debug)]
pub struct UploadForm {
    /// Decoded plain fields.
    pub fields: FieldMap,

    /// Uploaded files.
    pub files: FileMap,
}

impl FromRequest for UploadForm {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut dev::Payload) -> Self::Future {
        let config = UploadConfig::from_req(req);

        let parser = MultipartParser::from_req(req, payload, config.build_handlers())
            .map(|parser| parser.limits(config.get_limits()));

        let mut parser = match parser {
            Ok(parser) => parser,
            Err(err) => return ready(Err(config.map_error(req, err))).boxed_local(),
        };

        let req = req.clone();

        async move { parser.parse().await }
            .map_ok(|(fields, files)| UploadForm { fields, files })
            .map_err(move |err| config.map_error(&req, err))
            .boxed_local()
    }
}
