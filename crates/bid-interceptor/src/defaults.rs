//! Baseline mock response fields.
//!
//! The defaults exist only to guarantee a structurally valid mock before a
//! rule's own template is merged on top: identifier, price placeholders, and
//! dimensions resolved from the bid's declared media-type/size capabilities.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const BANNER: &str = "banner";
pub const VIDEO: &str = "video";

/// Placeholder price for synthesized responses.
pub const DEFAULT_CPM: f64 = 3.5764;
pub const DEFAULT_CURRENCY: &str = "EUR";
pub const DEFAULT_TTL: u64 = 360;
pub const DEFAULT_CREATIVE_ID: &str = "mock-creative-id";

/// Fallback size when a banner bid declares no sizes.
pub const BANNER_SIZE_FALLBACK: (u64, u64) = (300, 250);
/// Fallback size when a video bid declares no player size.
pub const VIDEO_SIZE_FALLBACK: (u64, u64) = (600, 500);

/// Response field marking a response as synthetic.
pub const SYNTHETIC_MARKER: &str = "isDebug";

/// Media-type post-processor: mutates a synthesized response in place, given
/// the originating bid. Looked up by the response's `mediaType`; a media type
/// with no registered processor is not an error.
pub type ResponseProcessor = Arc<dyn Fn(&mut Value, &Value) + Send + Sync>;

/// Registry of media-type post-processors, keyed by media type name.
pub type ResponseProcessors = HashMap<String, ResponseProcessor>;

/// Compute the baseline response for a bid, before rule overrides.
pub fn response_defaults(bid: &Value) -> Value {
    let mut response = json!({
        "requestId": bid.get("bidId").cloned().unwrap_or(Value::Null),
        "cpm": DEFAULT_CPM,
        "currency": DEFAULT_CURRENCY,
        "ttl": DEFAULT_TTL,
        "creativeId": DEFAULT_CREATIVE_ID,
        "netRevenue": false,
        "meta": {},
    });

    let media_type = bid
        .get("mediaType")
        .and_then(Value::as_str)
        .or_else(|| first_media_type(bid))
        .unwrap_or(BANNER)
        .to_string();

    let size = match media_type.as_str() {
        BANNER => declared_size(bid, BANNER, "sizes").or(Some(BANNER_SIZE_FALLBACK)),
        VIDEO => declared_size(bid, VIDEO, "playerSize").or(Some(VIDEO_SIZE_FALLBACK)),
        _ => None,
    };

    response["mediaType"] = json!(media_type);
    if let Some((width, height)) = size {
        response["width"] = json!(width);
        response["height"] = json!(height);
    }
    response
}

/// First media-type capability declared on the bid, in authored order.
fn first_media_type(bid: &Value) -> Option<&str> {
    bid.get("mediaTypes")
        .and_then(Value::as_object)
        .and_then(|types| types.keys().next())
        .map(String::as_str)
}

/// First declared size for a media type. Accepts both the nested form
/// (`sizes: [[300, 250], ...]`) and the flat form (`sizes: [300, 250]`).
fn declared_size(bid: &Value, media_type: &str, field: &str) -> Option<(u64, u64)> {
    let sizes = bid
        .get("mediaTypes")?
        .get(media_type)?
        .get(field)?
        .as_array()?;
    let first = sizes.first()?;
    if let Some(pair) = first.as_array() {
        return as_dimensions(pair);
    }
    if sizes.len() == 2 {
        return as_dimensions(sizes);
    }
    None
}

fn as_dimensions(pair: &[Value]) -> Option<(u64, u64)> {
    match pair {
        [w, h] => Some((w.as_u64()?, h.as_u64()?)),
        _ => None,
    }
}

/// Default media-type post-processors: fill in a placeholder creative payload
/// when the rule template did not provide one.
pub fn default_response_processors() -> ResponseProcessors {
    let mut processors: ResponseProcessors = HashMap::new();
    processors.insert(BANNER.to_string(), Arc::new(banner_processor));
    processors.insert(VIDEO.to_string(), Arc::new(video_processor));
    processors
}

fn banner_processor(response: &mut Value, _bid: &Value) {
    if response.get("ad").is_some() || response.get("adUrl").is_some() {
        return;
    }
    let width = response.get("width").and_then(Value::as_u64).unwrap_or(0);
    let height = response.get("height").and_then(Value::as_u64).unwrap_or(0);
    response["ad"] = json!(format!(
        "<div style=\"width:{width}px;height:{height}px;background:#f0f0f0\">mock creative</div>"
    ));
}

fn video_processor(response: &mut Value, _bid: &Value) {
    if response.get("vastXml").is_some() || response.get("vastUrl").is_some() {
        return;
    }
    let creative_id = response
        .get("creativeId")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CREATIVE_ID);
    response["vastXml"] = json!(format!(
        "<VAST version=\"3.0\"><Ad id=\"{creative_id}\"><InLine><Creatives/></InLine></Ad></VAST>"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_declared_banner_size() {
        let bid = json!({
            "bidId": "bid-1",
            "mediaTypes": {"banner": {"sizes": [[728, 90], [300, 250]]}},
        });
        let response = response_defaults(&bid);
        assert_eq!(response["requestId"], json!("bid-1"));
        assert_eq!(response["mediaType"], json!("banner"));
        assert_eq!(response["width"], json!(728));
        assert_eq!(response["height"], json!(90));
        assert_eq!(response["cpm"], json!(DEFAULT_CPM));
        assert_eq!(response["netRevenue"], json!(false));
        assert_eq!(response["meta"], json!({}));
    }

    #[test]
    fn test_defaults_flat_size_form() {
        let bid = json!({"bidId": "b", "mediaTypes": {"banner": {"sizes": [160, 600]}}});
        let response = response_defaults(&bid);
        assert_eq!(response["width"], json!(160));
        assert_eq!(response["height"], json!(600));
    }

    #[test]
    fn test_defaults_banner_fallback_size() {
        let response = response_defaults(&json!({"bidId": "b"}));
        assert_eq!(response["mediaType"], json!("banner"));
        assert_eq!(response["width"], json!(300));
        assert_eq!(response["height"], json!(250));
    }

    #[test]
    fn test_defaults_video_player_size() {
        let bid = json!({
            "bidId": "v",
            "mediaTypes": {"video": {"playerSize": [[640, 480]]}},
        });
        let response = response_defaults(&bid);
        assert_eq!(response["mediaType"], json!("video"));
        assert_eq!(response["width"], json!(640));
        assert_eq!(response["height"], json!(480));
    }

    #[test]
    fn test_defaults_video_fallback_size() {
        let bid = json!({"bidId": "v", "mediaType": "video"});
        let response = response_defaults(&bid);
        assert_eq!(response["width"], json!(600));
        assert_eq!(response["height"], json!(500));
    }

    #[test]
    fn test_defaults_first_declared_media_type_wins() {
        let bid = json!({
            "bidId": "b",
            "mediaTypes": {"video": {"playerSize": [[640, 480]]}, "banner": {}},
        });
        let response = response_defaults(&bid);
        assert_eq!(response["mediaType"], json!("video"));
    }

    #[test]
    fn test_banner_processor_fills_ad_only_when_absent() {
        let mut response = json!({"width": 300, "height": 250});
        banner_processor(&mut response, &Value::Null);
        let ad = response["ad"].as_str().unwrap();
        assert!(ad.contains("width:300px"));

        let mut preset = json!({"ad": "<b>custom</b>"});
        banner_processor(&mut preset, &Value::Null);
        assert_eq!(preset["ad"], json!("<b>custom</b>"));
    }

    #[test]
    fn test_video_processor_fills_vast_only_when_absent() {
        let mut response = json!({"creativeId": "c-1"});
        video_processor(&mut response, &Value::Null);
        assert!(response["vastXml"].as_str().unwrap().contains("c-1"));

        let mut preset = json!({"vastUrl": "https://example.test/vast"});
        video_processor(&mut preset, &Value::Null);
        assert!(preset.get("vastXml").is_none());
    }
}
