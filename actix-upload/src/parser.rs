//! Multipart body parser driving the upload handler chain.

use std::{cmp, collections::HashMap};

use actix_web::{
    dev,
    error::{ParseError, PayloadError},
    http::header::{self, ContentDisposition, HeaderMap, HeaderName, HeaderValue},
    web::{Buf as _, Bytes, BytesMut},
    HttpRequest,
};
use encoding_rs::{Encoding, UTF_8};
use futures_core::stream::Stream;
use memchr::memmem;
use mime::Mime;

use crate::{
    chain::HandlerChain,
    config::Limits,
    error::UploadError,
    handlers::{FileInfo, RawInput},
    map::{FieldMap, FileMap, ParsedForm},
    payload::PayloadBuffer,
    transfer::Base64Decoder,
};

const MAX_HEADERS: usize = 32;

/// Maximum size of a part header block, and of the line following a boundary.
const MAX_HEADER_SIZE: usize = 8 * 1024;

const CHARSET_FIELD: &str = "_charset_";

/// Streaming `multipart/form-data` parser.
///
/// Plain fields are decoded and collected in memory. The body of every file part is cut into
/// chunks of the size negotiated by the [`HandlerChain`] and pushed through its handlers, which
/// decide where the data ends up.
///
/// # Examples
///
/// ```
/// # #[actix_rt::main] async fn main() {
/// use actix_upload::{test::FormBuilder, MultipartParser, UploadConfig};
/// use actix_web::web::Bytes;
/// use futures_util::stream;
///
/// let (body, headers) = FormBuilder::new()
///     .text("title", "Report")
///     .file("doc", "report.txt", None, Bytes::from_static(b"quarterly numbers"))
///     .build();
///
/// let handlers = UploadConfig::default().build_handlers();
/// let stream = stream::iter([Ok(body)]);
/// let mut parser = MultipartParser::from_headers(&headers, stream, handlers).unwrap();
///
/// let (fields, files) = parser.parse().await.unwrap();
/// assert_eq!(fields.get("title").unwrap(), "Report");
/// assert_eq!(files.get("doc").unwrap().size(), 17);
/// # }
/// ```
pub struct MultipartParser {
    payload: PayloadBuffer,
    boundary: String,
    /// `CRLF--boundary`, the sequence terminating a part body.
    delimiter: Vec<u8>,
    headers: Option<HeaderMap>,
    content_length: Option<u64>,
    encoding: &'static Encoding,
    limits: Limits,
    handlers: HandlerChain,
}

impl MultipartParser {
    /// Constructs a parser from a body stream and a multipart boundary.
    pub fn new<S>(stream: S, boundary: impl Into<String>, handlers: HandlerChain) -> Self
    where
        S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    {
        let boundary = boundary.into();
        let delimiter = format!("\r\n--{boundary}").into_bytes();

        MultipartParser {
            payload: PayloadBuffer::new(stream),
            boundary,
            delimiter,
            headers: None,
            content_length: None,
            encoding: UTF_8,
            limits: Limits::default(),
            handlers,
        }
    }

    /// Constructs a parser from request headers and a body stream.
    ///
    /// The boundary is taken from the `Content-Type` header and the body length from
    /// `Content-Length`.
    pub fn from_headers<S>(
        headers: &HeaderMap,
        stream: S,
        handlers: HandlerChain,
    ) -> Result<Self, UploadError>
    where
        S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    {
        let (_, boundary) = Self::find_ct_and_boundary(headers)?;

        let content_length = headers
            .get(&header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse().ok());

        let mut parser = Self::new(stream, boundary, handlers).content_length(content_length);
        parser.headers = Some(headers.clone());
        Ok(parser)
    }

    /// Constructs a parser from an actix-web request and its payload.
    pub fn from_req(
        req: &HttpRequest,
        payload: &mut dev::Payload,
        handlers: HandlerChain,
    ) -> Result<Self, UploadError> {
        Self::from_headers(req.headers(), payload.take(), handlers)
    }

    /// Extract Content-Type and boundary info from headers.
    pub(crate) fn find_ct_and_boundary(headers: &HeaderMap) -> Result<(Mime, String), UploadError> {
        let content_type = headers
            .get(&header::CONTENT_TYPE)
            .ok_or(UploadError::ContentTypeMissing)?
            .to_str()
            .ok()
            .and_then(|content_type| content_type.parse::<Mime>().ok())
            .ok_or(UploadError::ContentTypeParse)?;

        if content_type.type_() != mime::MULTIPART {
            return Err(UploadError::ContentTypeIncompatible);
        }

        let boundary = content_type
            .get_param(mime::BOUNDARY)
            .ok_or(UploadError::BoundaryMissing)?
            .as_str()
            .to_owned();

        Ok((content_type, boundary))
    }

    /// Sets the declared length of the request body.
    ///
    /// The parser never reads past this length.
    pub fn content_length(mut self, content_length: Option<u64>) -> Self {
        self.content_length = content_length;
        self
    }

    /// Sets the encoding of plain fields that do not declare a charset. Defaults to UTF-8.
    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sets parsing limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the handler chain.
    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }

    /// Returns the handler chain for modification.
    ///
    /// Modifications are rejected once [`parse`](Self::parse) has been called.
    pub fn handlers_mut(&mut self) -> &mut HandlerChain {
        &mut self.handlers
    }

    /// Parses the whole body into plain fields and uploaded files.
    ///
    /// On failure every handler is told that the upload was interrupted.
    pub async fn parse(&mut self) -> Result<ParsedForm, UploadError> {
        if self.handlers.is_locked() {
            return Err(UploadError::AlreadyParsed);
        }
        self.handlers.lock();

        let input = RawInput {
            headers: self.headers.as_ref(),
            content_length: self.content_length,
            boundary: &self.boundary,
            encoding: self.encoding,
        };

        match self.handlers.handle_raw_input(&input) {
            Ok(Some(form)) => {
                log::debug!("request body handled by a raw input handler");
                return Ok(form);
            }
            Ok(None) => {}
            Err(err) => {
                self.handlers.upload_interrupted();
                return Err(err);
            }
        }

        self.payload.set_content_length(self.content_length);

        let res = match self.content_length {
            Some(0) => Ok(ParsedForm::default()),
            _ => self.parse_parts().await,
        };

        let res = res.and_then(|form| {
            self.handlers.upload_complete()?;
            Ok(form)
        });

        if let Err(ref err) = res {
            log::debug!("upload aborted: {err}");
            self.handlers.upload_interrupted();

            if let UploadError::UploadStopped {
                connection_reset: false,
            } = err
            {
                if let Err(err) = self.payload.drain().await {
                    log::warn!("failed to discard rest of request body: {err}");
                }
            }
        }

        res
    }

    async fn parse_parts(&mut self) -> Result<ParsedForm, UploadError> {
        let mut fields = FieldMap::new();
        let mut files = FileMap::new();
        let mut field_memory = 0;

        let chunk_size = self.handlers.chunk_size();

        self.skip_preamble().await?;

        while !self.read_boundary_tail().await? {
            let headers = self.read_part_headers().await?;
            let part = Part::from_headers(&headers)?;
            let mut body = PartBody::new(&part);

            match part.file_name {
                None => {
                    if let Some(max) = self.limits.max_fields {
                        if fields.len() >= max {
                            return Err(UploadError::TooManyFields(max));
                        }
                    }

                    field_memory += part.field_name.len();

                    let mut data = BytesMut::new();
                    while let Some(chunk) = self.read_chunk(&mut body, chunk_size).await? {
                        field_memory += chunk.len();
                        if let Some(max) = self.limits.max_field_memory {
                            if field_memory > max {
                                return Err(UploadError::FieldDataTooLarge(max));
                            }
                        }
                        data.extend_from_slice(&chunk);
                    }

                    let encoding = part
                        .charset()
                        .and_then(|charset| Encoding::for_label(charset.as_bytes()))
                        .unwrap_or(self.encoding);
                    let (value, _, malformed) = encoding.decode(&data);
                    if malformed {
                        log::debug!(
                            "field `{}` is not valid {}",
                            part.field_name,
                            encoding.name()
                        );
                    }

                    if part.field_name == CHARSET_FIELD {
                        match Encoding::for_label(value.trim().as_bytes()) {
                            Some(encoding) => self.encoding = encoding,
                            None => log::warn!("ignoring unknown form charset `{value}`"),
                        }
                    }

                    fields.append(part.field_name, value.into_owned());
                }

                Some(ref file_name) if file_name.is_empty() => {
                    log::debug!("skipping empty file input `{}`", part.field_name);
                    while self.read_chunk(&mut body, chunk_size).await?.is_some() {}
                }

                Some(ref file_name) => {
                    if let Some(max) = self.limits.max_files {
                        if files.len() >= max {
                            return Err(UploadError::TooManyFiles(max));
                        }
                    }

                    let info = part.file_info(file_name);
                    self.handlers.new_file(&info)?;

                    while let Some(chunk) = self.read_chunk(&mut body, chunk_size).await? {
                        if !chunk.is_empty() {
                            self.handlers.receive(chunk)?;
                        }
                    }

                    let file = self.handlers.complete()?;
                    files.append(info.field_name, file);
                }
            }
        }

        Ok((fields, files))
    }

    /// Discards everything up to and including the first dash-boundary.
    ///
    /// The body may either start with the dash-boundary or have a preamble ending with a line
    /// break followed by it.
    async fn skip_preamble(&mut self) -> Result<(), UploadError> {
        let delimiter = &self.delimiter;
        let dash_boundary = &delimiter[2..];
        let mut at_start = true;

        self.payload
            .read_with(|payload| {
                if at_start {
                    let n = cmp::min(payload.buf.len(), dash_boundary.len());

                    if payload.buf[..n] != dash_boundary[..n] {
                        at_start = false;
                    } else if n == dash_boundary.len() {
                        payload.buf.advance(n);
                        return Ok(Some(()));
                    } else if !payload.eof {
                        return Ok(None);
                    }
                }

                match memmem::find(&payload.buf, delimiter) {
                    Some(idx) => {
                        payload.buf.advance(idx + delimiter.len());
                        Ok(Some(()))
                    }

                    None if payload.eof => Err(UploadError::BoundaryMissing),

                    None => {
                        // keep what could be the start of a delimiter
                        let keep = delimiter.len() - 1;
                        if !at_start && payload.buf.len() > keep {
                            let discard = payload.buf.len() - keep;
                            payload.buf.advance(discard);
                        }
                        Ok(None)
                    }
                }
            })
            .await
    }

    /// Reads what follows a dash-boundary.
    ///
    /// Returns `true` for the close delimiter, after which anything left is epilogue, and `false`
    /// when another part follows.
    async fn read_boundary_tail(&mut self) -> Result<bool, UploadError> {
        self.payload
            .read_with(|payload| {
                if payload.buf.len() < 2 {
                    return if payload.eof {
                        Err(UploadError::Incomplete)
                    } else {
                        Ok(None)
                    };
                }

                if payload.buf.starts_with(b"--") {
                    payload.buf.clear();
                    return Ok(Some(true));
                }

                match payload.readline()? {
                    None if payload.buf.len() > MAX_HEADER_SIZE => {
                        Err(ParseError::TooLarge.into())
                    }
                    None => Ok(None),

                    // transport padding is allowed before the line break
                    Some(line) if line.iter().all(u8::is_ascii_whitespace) => Ok(Some(false)),

                    Some(_) => Err(UploadError::BoundaryMissing),
                }
            })
            .await
    }

    async fn read_part_headers(&mut self) -> Result<HeaderMap, UploadError> {
        self.payload
            .read_with(|payload| {
                // no header lines at all
                if payload.buf.starts_with(b"\r\n") {
                    payload.buf.advance(2);
                    return Ok(Some(HeaderMap::new()));
                }

                match payload.read_until(b"\r\n\r\n")? {
                    None if payload.buf.len() > MAX_HEADER_SIZE => {
                        Err(ParseError::TooLarge.into())
                    }
                    None => Ok(None),
                    Some(bytes) if bytes.len() > MAX_HEADER_SIZE => {
                        Err(ParseError::TooLarge.into())
                    }
                    Some(bytes) => parse_headers(&bytes).map(Some),
                }
            })
            .await
    }

    /// Reads the next chunk of the current part body, or `None` once the part is complete.
    ///
    /// The chunk is decoded if the part declared a transfer encoding, and may be empty. It is never
    /// longer than `max`.
    async fn read_chunk(
        &mut self,
        body: &mut PartBody,
        max: usize,
    ) -> Result<Option<Bytes>, UploadError> {
        if !body.pending.is_empty() {
            let len = cmp::min(max, body.pending.len());
            return Ok(Some(body.pending.split_to(len)));
        }

        if body.done {
            return Ok(None);
        }

        let delimiter = &self.delimiter;
        let (raw, last) = self
            .payload
            .read_with(|payload| read_body_chunk(payload, delimiter, max))
            .await?;
        body.done = last;

        let Some(decoder) = body.decoder.as_mut() else {
            return Ok(Some(raw));
        };

        let mut chunk = decoder
            .decode(&raw)
            .map_err(|_| UploadError::Base64(body.field_name.clone()))?;

        if last {
            if let Some(decoder) = body.decoder.take() {
                let tail = decoder
                    .finish()
                    .map_err(|_| UploadError::Base64(body.field_name.clone()))?;

                if !tail.is_empty() {
                    let mut buf = BytesMut::from(&chunk[..]);
                    buf.extend_from_slice(&tail);
                    chunk = buf.freeze();
                }
            }
        }

        // bytes carried over between chunks can decode to more than `max`
        if chunk.len() > max {
            body.pending = chunk.split_off(max);
        }

        Ok(Some(chunk))
    }
}

/// Splits up to `max` bytes of part body off the buffer.
///
/// Returns the chunk and whether it is the last one of the part, in which case the delimiter is
/// consumed too. The last `delimiter.len() - 1` buffered bytes are held back until it is known
/// that they do not start a delimiter.
fn read_body_chunk(
    payload: &mut PayloadBuffer,
    delimiter: &[u8],
    max: usize,
) -> Result<Option<(Bytes, bool)>, UploadError> {
    match memmem::find(&payload.buf, delimiter) {
        Some(idx) if idx > max => Ok(Some((payload.buf.split_to(max).freeze(), false))),

        Some(idx) => {
            let chunk = payload.buf.split_to(idx).freeze();
            payload.buf.advance(delimiter.len());
            Ok(Some((chunk, true)))
        }

        None => {
            let available = payload.buf.len().saturating_sub(delimiter.len() - 1);

            if available >= max {
                Ok(Some((payload.buf.split_to(max).freeze(), false)))
            } else if payload.eof {
                Err(UploadError::Incomplete)
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_headers(bytes: &[u8]) -> Result<HeaderMap, UploadError> {
    let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];

    match httparse::parse_headers(bytes, &mut hdrs).map_err(ParseError::from)? {
        httparse::Status::Complete((_, hdrs)) => {
            let mut headers = HeaderMap::with_capacity(hdrs.len());

            for h in hdrs {
                let name = HeaderName::try_from(h.name).map_err(|_| ParseError::Header)?;
                let value = HeaderValue::try_from(h.value).map_err(|_| ParseError::Header)?;
                headers.append(name, value);
            }

            Ok(headers)
        }

        httparse::Status::Partial => Err(ParseError::Header.into()),
    }
}

/// Reduces a client-supplied file name to its last path component.
///
/// Returns an empty string when nothing usable is left.
fn sanitize_file_name(name: &str) -> String {
    let name = name.rsplit(&['/', '\\'][..]).next().unwrap_or(name).trim();

    match name {
        "." | ".." => String::new(),
        name => name.to_owned(),
    }
}

/// Metadata extracted from the header block of one part.
#[derive(Debug)]
struct Part {
    field_name: String,
    file_name: Option<String>,
    content_type: Option<Mime>,
    content_length: Option<u64>,
    base64: bool,
}

impl Part {
    fn from_headers(headers: &HeaderMap) -> Result<Self, UploadError> {
        let cd = headers
            .get(&header::CONTENT_DISPOSITION)
            .and_then(|cd| ContentDisposition::from_raw(cd).ok())
            .filter(|cd| cd.is_form_data())
            .ok_or(UploadError::ContentDispositionMissing)?;

        let field_name = cd
            .get_name()
            .ok_or(UploadError::ContentDispositionNameMissing)?
            .to_owned();

        let file_name = match cd.get_filename_ext() {
            Some(ext) => {
                let encoding =
                    Encoding::for_label(ext.charset.to_string().as_bytes()).unwrap_or(UTF_8);
                Some(encoding.decode_without_bom_handling(&ext.value).0.into_owned())
            }
            None => cd.get_filename().map(str::to_owned),
        }
        .map(|name| sanitize_file_name(&name));

        let content_type = headers
            .get(&header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .and_then(|ct| ct.parse::<Mime>().ok());

        if let Some(ref ct) = content_type {
            if ct.type_() == mime::MULTIPART {
                return Err(UploadError::Nested);
            }
        }

        let content_length = match headers.get(&header::CONTENT_LENGTH) {
            Some(len) => Some(
                len.to_str()
                    .ok()
                    .and_then(|len| len.trim().parse::<u64>().ok())
                    .ok_or(ParseError::Header)?,
            ),
            None => None,
        };

        let base64 = match headers
            .get("content-transfer-encoding")
            .and_then(|cte| cte.to_str().ok())
        {
            Some(cte) if cte.trim().eq_ignore_ascii_case("base64") => true,
            Some(cte)
                if ["7bit", "8bit", "binary"]
                    .iter()
                    .any(|known| cte.trim().eq_ignore_ascii_case(known)) =>
            {
                false
            }
            Some(cte) => {
                log::warn!("unsupported transfer encoding `{cte}` for `{field_name}`, reading as-is");
                false
            }
            None => false,
        };

        Ok(Part {
            field_name,
            file_name,
            content_type,
            content_length,
            base64,
        })
    }

    fn charset(&self) -> Option<&str> {
        self.content_type
            .as_ref()?
            .get_param(mime::CHARSET)
            .map(|charset| charset.as_str())
    }

    fn file_info(&self, file_name: &str) -> FileInfo {
        let content_type_extra = self
            .content_type
            .iter()
            .flat_map(|ct| ct.params())
            .filter(|(name, _)| *name != mime::CHARSET)
            .map(|(name, value)| (name.as_str().to_owned(), value.as_str().to_owned()))
            .collect::<HashMap<_, _>>();

        FileInfo {
            field_name: self.field_name.clone(),
            file_name: file_name.to_owned(),
            content_type: self
                .content_type
                .as_ref()
                .map(|ct| ct.essence_str().to_owned())
                .unwrap_or_default(),
            charset: self.charset().map(str::to_owned),
            content_length: self.content_length,
            content_type_extra,
        }
    }
}

/// Read state of one part body.
struct PartBody {
    field_name: String,
    decoder: Option<Base64Decoder>,
    /// Decoded data not yet handed out.
    pending: Bytes,
    done: bool,
}

impl PartBody {
    fn new(part: &Part) -> Self {
        PartBody {
            field_name: part.field_name.clone(),
            decoder: part.base64.then(Base64Decoder::default),
            pending: Bytes::new(),
            done: false,
        }
    }
}
