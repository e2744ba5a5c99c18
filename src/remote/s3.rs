use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::{debug, instrument, trace};

use super::object_store::{ObjectMetadata, ObjectStore, key_not_found};
use crate::backend::slice_payload;
use crate::error::{Error, Result};

/// Validity of presigned request URLs.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// S3-compatible bucket accessed through presigned requests.
#[derive(Debug)]
pub struct S3ObjectStore {
    bucket: Bucket,
    credentials: Credentials,
    client: Client,
}

pub struct S3Settings<'a> {
    pub endpoint: &'a str,
    pub region: &'a str,
    pub bucket: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub path_style: bool,
    pub op_timeout: Duration,
    pub connect_timeout: Duration,
}

impl S3ObjectStore {
    pub fn new(settings: S3Settings<'_>) -> Result<Self> {
        let endpoint = settings.endpoint.parse().map_err(|e| {
            Error::Config(format!("invalid S3 endpoint URL '{}': {e}", settings.endpoint))
        })?;
        let url_style = if settings.path_style {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };
        let bucket = Bucket::new(
            endpoint,
            url_style,
            settings.bucket.to_owned(),
            settings.region.to_owned(),
        )
        .map_err(|e| Error::Config(format!("failed to create S3 bucket handle: {e}")))?;
        let credentials = Credentials::new(settings.access_key, settings.secret_key);

        let client = Client::builder()
            .timeout(settings.op_timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(S3ObjectStore {
            bucket,
            credentials,
            client,
        })
    }

    async fn send(&self, request: RequestBuilder, op: &str, key: &str) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(key_not_found(key));
        }
        if status.is_success() || status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Remote(format!("S3 {op} {key}: {status}: {body}")))
    }
}

/// `Range` header value for an `offset`/`length` read; `None` reads it all.
fn range_header(offset: u64, length: u64) -> Result<Option<String>> {
    match (offset, length) {
        (0, 0) => Ok(None),
        (offset, 0) => Ok(Some(format!("bytes={offset}-"))),
        (offset, length) => {
            let end = offset
                .checked_add(length - 1)
                .ok_or(Error::OutOfRange { offset, size: 0 })?;
            Ok(Some(format!("bytes={offset}-{end}")))
        }
    }
}

/// Object size from a `Content-Range: bytes */<size>` header.
fn unsatisfied_range_size(response: &Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|size| size.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket.name())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn put(&self, key: &str, payload: Bytes, metadata: &ObjectMetadata) -> Result<()> {
        let mut action = self.bucket.put_object(Some(&self.credentials), key);
        for (name, value) in metadata {
            action.headers_mut().insert(*name, value.clone());
        }
        let url = action.sign(PRESIGN_DURATION);

        let mut request = self.client.put(url.as_str());
        for (name, value) in metadata {
            request = request.header(*name, value);
        }
        let size = payload.len();
        self.send(request.body(payload), "PUT", key).await?;
        debug!(size, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str, offset: u64, length: u64) -> Result<Bytes> {
        let range = range_header(offset, length)?;
        let mut action = self.bucket.get_object(Some(&self.credentials), key);
        if let Some(range) = &range {
            action.headers_mut().insert("range", range.clone());
        }
        let url = action.sign(PRESIGN_DURATION);

        let mut request = self.client.get(url.as_str());
        if let Some(range) = &range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = self.send(request, "GET", key).await?;

        match response.status() {
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let size = unsatisfied_range_size(&response);
                if offset == 0 && size == 0 {
                    return Ok(Bytes::new());
                }
                Err(Error::OutOfRange { offset, size })
            }
            // server ignored the range
            StatusCode::OK if range.is_some() => {
                let body = response.bytes().await?;
                slice_payload(&body, offset, length)
            }
            _ => {
                let body = response.bytes().await?;
                trace!(key, len = body.len(), "fetched object");
                Ok(body)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // S3 deletes are idempotent, so look first to report missing blocks.
        if !self.exists(key).await? {
            return Err(key_not_found(key));
        }
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        self.send(self.client.delete(url.as_str()), "DELETE", key)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key)
            .sign(PRESIGN_DURATION);
        match self.send(self.client.head(url.as_str()), "HEAD", key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", prefix.to_owned());
            if let Some(token) = &continuation_token {
                action.query_mut().insert("continuation-token", token.clone());
            }
            let url = action.sign(PRESIGN_DURATION);

            let body = self
                .send(self.client.get(url.as_str()), "LIST", prefix)
                .await?
                .bytes()
                .await?;
            let parsed = ListObjectsV2::parse_response(&body).map_err(|e| {
                Error::Remote(format!("S3 LIST {prefix}: failed to parse response: {e}"))
            })?;

            keys.extend(
                parsed
                    .contents
                    .into_iter()
                    .map(|obj| obj.key)
                    .filter(|key| !key.ends_with('/')),
            );

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        debug!(count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let url = self
            .bucket
            .head_bucket(Some(&self.credentials))
            .sign(PRESIGN_DURATION);
        let name = self.bucket.name().to_owned();
        self.send(self.client.head(url.as_str()), "HEAD bucket", &name)
            .await
            .map_err(|err| match err {
                err if err.is_not_found() => Error::Config(format!("bucket {name} does not exist")),
                err => err,
            })?;
        Ok(())
    }
}
