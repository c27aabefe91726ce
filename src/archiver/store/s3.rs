use super::ObjectStore;
use crate::error::{ArchiverError, RemoteError};
use anyhow::{Result, anyhow};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;

/// S3 bucket access over a private current-thread runtime; every call blocks
/// until the request completes.
pub struct S3ObjectStore {
    bucket: String,
    prefix: String,
    client: aws_sdk_s3::Client,
    runtime: tokio::runtime::Runtime,
}

fn env_bool(var: &str) -> Option<bool> {
    let raw = std::env::var(var).ok()?;
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "off" => Some(false),
        _ => None,
    }
}

async fn client_from_env() -> aws_sdk_s3::Client {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let endpoint_url = std::env::var("ARCHIVER_S3_ENDPOINT_URL").ok();
    let force_path_style =
        env_bool("ARCHIVER_S3_FORCE_PATH_STYLE").unwrap_or(endpoint_url.is_some());

    let mut b = aws_sdk_s3::config::Builder::from(&cfg);
    if let Some(url) = endpoint_url {
        b = b.endpoint_url(url);
    }
    if force_path_style {
        b = b.force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(b.build())
}

fn map_sdk_error<E, R>(key: &str, err: SdkError<E, R>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => RemoteError::NotFound(key.to_string()),
        _ => RemoteError::request(key, DisplayErrorContext(&err)),
    }
}

/// Percent-encodes a key for the `x-amz-copy-source` header.
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let mut out = format!("{bucket}/");
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'/' | b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

impl S3ObjectStore {
    pub fn connect(bucket: String, prefix: String) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                anyhow!(ArchiverError::InvalidConfig(format!(
                    "tokio runtime init failed: {err}"
                )))
            })?;
        let client = runtime.block_on(client_from_env());
        Ok(Self {
            bucket,
            prefix,
            client,
            runtime,
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return key;
        }
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
    }
}

impl ObjectStore for S3ObjectStore {
    fn put(&self, key: &str, body: &Path) -> Result<(), RemoteError> {
        let full = self.full_key(key);
        self.runtime.block_on(async {
            let stream = ByteStream::from_path(body)
                .await
                .map_err(|err| RemoteError::request(&full, err))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&full)
                .body(stream)
                .send()
                .await
                .map_err(|err| map_sdk_error(&full, err))?;
            Ok(())
        })
    }

    fn copy(&self, src: &str, dst: &str) -> Result<(), RemoteError> {
        let full_src = self.full_key(src);
        let full_dst = self.full_key(dst);
        self.runtime.block_on(async {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(encode_copy_source(&self.bucket, &full_src))
                .key(&full_dst)
                .send()
                .await
                .map_err(|err| map_sdk_error(&full_src, err))?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let full = self.full_key(key);
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full)
                .send()
                .await
                .map_err(|err| map_sdk_error(&full, err))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let full = self.full_key(key);
        self.runtime.block_on(async {
            let resp = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&full)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    return match map_sdk_error(&full, err) {
                        RemoteError::NotFound(_) => Ok(None),
                        other => Err(other),
                    };
                }
            };
            let collected = resp
                .body
                .collect()
                .await
                .map_err(|err| RemoteError::request(&full, err))?;
            Ok(Some(collected.into_bytes().to_vec()))
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let full = self.full_key(prefix);
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full);
                if let Some(t) = token.as_deref() {
                    req = req.continuation_token(t);
                }
                let resp = req.send().await.map_err(|err| map_sdk_error(&full, err))?;
                for obj in resp.contents() {
                    if let Some(k) = obj.key() {
                        keys.push(self.strip_prefix(k).to_string());
                    }
                }
                if resp.is_truncated().unwrap_or(false) {
                    token = resp.next_continuation_token().map(ToOwned::to_owned);
                    if token.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }
            keys.sort();
            Ok(keys)
        })
    }

    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.prefix)
        }
    }
}
