use crate::error::{AgentError, AgentResult};
use crate::http::{OutboundRequest, Transport};
use crate::models::ImageRef;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

/// Raw bytes of a caller-supplied image plus the name it should carry.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Vec<u8>,
    pub name: String,
}

/// Loads the first image of a listing payload.
pub async fn load_first(images: &[ImageRef], transport: &dyn Transport) -> AgentResult<SourceImage> {
    let first = images
        .first()
        .ok_or_else(|| AgentError::validation("images", "at least one image is required"))?;
    load(first, transport).await
}

pub async fn load(image: &ImageRef, transport: &dyn Transport) -> AgentResult<SourceImage> {
    match image {
        ImageRef::Location(location) => load_location(location, None, transport).await,
        ImageRef::Descriptor(descriptor) => {
            if let Some(data) = descriptor.data.as_deref().filter(|d| !d.trim().is_empty()) {
                let bytes = decode_base64(strip_data_url(data))?;
                return Ok(SourceImage {
                    bytes,
                    name: descriptor.name.clone().unwrap_or_else(|| "photo".into()),
                });
            }
            match descriptor.url.as_deref() {
                Some(url) => load_location(url, descriptor.name.clone(), transport).await,
                None => Err(AgentError::validation(
                    "images",
                    "image descriptor has neither url nor data",
                )),
            }
        }
    }
}

async fn load_location(
    location: &str,
    name: Option<String>,
    transport: &dyn Transport,
) -> AgentResult<SourceImage> {
    let location = location.trim();
    if location.starts_with("data:") {
        return Ok(SourceImage {
            bytes: decode_base64(strip_data_url(location))?,
            name: name.unwrap_or_else(|| "photo".into()),
        });
    }
    let parsed = reqwest::Url::parse(location)
        .map_err(|_| AgentError::validation("images", format!("invalid_image_url: {location}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AgentError::validation(
            "images",
            format!("unsupported_url_scheme: {location}"),
        ));
    }
    let name = name.unwrap_or_else(|| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|segment| !segment.is_empty())
            .unwrap_or_else(|| "photo".into())
    });
    let response = transport.send(OutboundRequest::get(location)).await?;
    if !response.is_success() {
        return Err(AgentError::UpstreamHttp {
            status: response.status,
            body: format!("image fetch failed for {location}"),
        });
    }
    Ok(SourceImage {
        bytes: response.body,
        name,
    })
}

fn strip_data_url(data: &str) -> &str {
    match data.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => data,
    }
}

fn decode_base64(payload: &str) -> AgentResult<Vec<u8>> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| AgentError::validation("images", format!("invalid base64 image: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{ScriptedTransport, text_response};
    use crate::models::ImageDescriptor;

    #[tokio::test]
    async fn data_url_is_decoded_without_network() {
        let transport = ScriptedTransport::new();
        let image = ImageRef::Location("data:image/png;base64,aGVsbG8=".into());
        let out = load(&image, &transport).await.unwrap();
        assert_eq!(out.bytes, b"hello");
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn url_is_fetched_and_named_from_path() {
        let transport = ScriptedTransport::new();
        transport.route("cdn.example/img/shoe.png", None, text_response(200, "PNGDATA"));
        let image = ImageRef::Location("https://cdn.example/img/shoe.png".into());
        let out = load(&image, &transport).await.unwrap();
        assert_eq!(out.bytes, b"PNGDATA");
        assert_eq!(out.name, "shoe.png");
    }

    #[tokio::test]
    async fn descriptor_data_takes_precedence() {
        let transport = ScriptedTransport::new();
        let image = ImageRef::Descriptor(ImageDescriptor {
            url: Some("https://cdn.example/ignored.jpg".into()),
            data: Some("aGk=".into()),
            name: Some("front.jpg".into()),
        });
        let out = load(&image, &transport).await.unwrap();
        assert_eq!(out.bytes, b"hi");
        assert_eq!(out.name, "front.jpg");
    }

    #[tokio::test]
    async fn rejects_non_http_and_empty_lists() {
        let transport = ScriptedTransport::new();
        let err = load(&ImageRef::Location("file:///etc/passwd".into()), &transport)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = load_first(&[], &transport).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation { ref field, .. } if field == "images"));
    }

    #[tokio::test]
    async fn failed_fetch_is_upstream_http() {
        let transport = ScriptedTransport::new();
        transport.route("cdn.example", None, text_response(404, "gone"));
        let err = load(&ImageRef::Location("https://cdn.example/a.jpg".into()), &transport)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UpstreamHttp { status: 404, .. }));
    }
}
