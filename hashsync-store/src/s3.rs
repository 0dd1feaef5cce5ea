use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, StorageClass as S3StorageClass};
use aws_sdk_s3::Client;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Acl, Error, GetObject, HeadObject, PutOptions, RemoteStore, StorageClass, VersionEntry};

/// `RemoteStore` backed by a real S3 bucket, built on the `aws-sdk-s3` and
/// `aws-config` crates.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn connect(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        let region_provider = aws_config::Region::new(region.into());
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn storage_class_to_sdk(sc: StorageClass) -> S3StorageClass {
    match sc {
        StorageClass::Standard => S3StorageClass::Standard,
        StorageClass::ReducedRedundancy => S3StorageClass::ReducedRedundancy,
    }
}

fn acl_to_sdk(acl: Acl) -> ObjectCannedAcl {
    match acl {
        Acl::Private => ObjectCannedAcl::Private,
        Acl::PublicRead => ObjectCannedAcl::PublicRead,
    }
}

#[async_trait::async_trait]
impl RemoteStore for S3Store {
    async fn head(&self, key: &str) -> Result<Option<HeadObject>, Error> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match resp {
            Ok(out) => {
                let last_modified = out
                    .last_modified()
                    .map(|dt| dt.secs())
                    .unwrap_or(0);
                Ok(Some(HeadObject {
                    last_modified,
                    content_encoding: out.content_encoding().map(str::to_owned),
                    etag: out.e_tag().unwrap_or_default().trim_matches('"').to_owned(),
                }))
            }
            Err(e) => {
                if is_not_found(&e) {
                    Ok(None)
                } else {
                    Err(Error::S3(e.to_string()))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<GetObject, Error> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Error::NotFound(key.to_owned())
                } else {
                    Error::S3(e.to_string())
                }
            })?;

        let content_encoding = out.content_encoding().map(str::to_owned);
        let body = out
            .body
            .into_async_read();
        Ok(GetObject {
            content_encoding,
            body: Box::new(body),
        })
    }

    async fn put(
        &self,
        key: &str,
        mut body: Box<dyn AsyncRead + Unpin + Send>,
        opts: PutOptions,
    ) -> Result<(), Error> {
        // Buffered rather than chunk-streamed: ByteStream's streaming
        // constructors need a known content length or a Stream<Bytes>
        // adapter the async-trait boundary doesn't give us for free. Blobs
        // here are files a single host produces locally, so this is a
        // reasonable simplification (see DESIGN.md).
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;

        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(storage_class_to_sdk(opts.storage_class))
            .acl(acl_to_sdk(opts.acl))
            .body(ByteStream::from(buf));

        if let Some(encoding) = opts.content_encoding {
            req = req.content_encoding(encoding);
        }

        req.send().await.map_err(|e| Error::S3(e.to_string()))?;
        Ok(())
    }

    async fn copy(&self, key: &str, storage_class: StorageClass) -> Result<(), Error> {
        let source = format!("{}/{}", self.bucket, key);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(source)
            // explicit Copy directive: preserves content-encoding across the
            // self-copy rather than relying on an unstated default.
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Copy)
            .storage_class(storage_class_to_sdk(storage_class))
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    Error::NotFound(key.to_owned())
                } else {
                    Error::S3(e.to_string())
                }
            })?;
        Ok(())
    }

    async fn list_versions(&self) -> Result<Vec<VersionEntry>, Error> {
        let mut out = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_id_marker: Option<String> = None;

        loop {
            let mut req = self.client.list_object_versions().bucket(&self.bucket);
            if let Some(ref k) = key_marker {
                req = req.key_marker(k);
            }
            if let Some(ref v) = version_id_marker {
                req = req.version_id_marker(v);
            }
            let resp = req.send().await.map_err(|e| Error::S3(e.to_string()))?;

            for v in resp.versions() {
                let key = v.key().unwrap_or_default().to_owned();
                if key.starts_with("objectlist") {
                    continue;
                }
                let last_modified = v
                    .last_modified()
                    .map(|dt| dt.secs())
                    .unwrap_or(0);
                out.push(VersionEntry {
                    key,
                    version_id: v.version_id().unwrap_or_default().to_owned(),
                    last_modified,
                });
            }
            // delete markers are intentionally not surfaced at all

            if resp.is_truncated().unwrap_or(false) {
                key_marker = resp.next_key_marker().map(str::to_owned);
                version_id_marker = resp.next_version_id_marker().map(str::to_owned);
            } else {
                break;
            }
        }

        Ok(out)
    }

    async fn delete(&self, key: &str, version_id: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| Error::S3(e.to_string()))?;
        Ok(())
    }

    async fn delete_batch(&self, items: &[(String, String)]) -> Result<(), Error> {
        use aws_sdk_s3::types::{Delete, ObjectIdentifier};

        let objects: Result<Vec<_>, _> = items
            .iter()
            .map(|(key, version_id)| {
                ObjectIdentifier::builder()
                    .key(key)
                    .version_id(version_id)
                    .build()
            })
            .collect();
        let objects = objects.map_err(|e| Error::S3(e.to_string()))?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|e| Error::S3(e.to_string()))?;

        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| Error::S3(e.to_string()))?;
        Ok(())
    }
}

fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool
where
    E: std::error::Error + 'static,
{
    use aws_sdk_s3::error::SdkError;
    match err {
        SdkError::ServiceError(service_err) => {
            let raw = service_err.raw();
            raw.status().as_u16() == 404
        }
        _ => false,
    }
}
