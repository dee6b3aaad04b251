use axum::http::Method;

use mproxy_core::RouteOp;
use mproxy_protocol::ApiFormat;

/// What one front-door path means. Every provider prefix mounts the same
/// surface; the path decides operation, inbound dialect and (for
/// Google-style routes) the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    ModelsList,
    Call {
        op: RouteOp,
        inbound_format: ApiFormat,
        model_from_path: Option<String>,
        stream_from_path: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteError {
    pub status: u16,
    pub message: &'static str,
}

pub fn classify_route(method: &Method, path: &str, query: Option<&str>) -> Result<Route, RouteError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let not_found = RouteError {
        status: 404,
        message: "unknown path",
    };
    let wrong_method = RouteError {
        status: 405,
        message: "method not allowed",
    };

    match segments.as_slice() {
        ["v1", "models"] => {
            if method != Method::GET {
                return Err(wrong_method);
            }
            Ok(Route::ModelsList)
        }
        ["v1", "chat", "completions"] => {
            post_only(method, wrong_method)?;
            Ok(Route::Call {
                op: RouteOp::ChatCompletions,
                inbound_format: ApiFormat::Openai,
                model_from_path: None,
                stream_from_path: false,
            })
        }
        ["v1", "messages"] => {
            post_only(method, wrong_method)?;
            Ok(Route::Call {
                op: RouteOp::Messages,
                inbound_format: ApiFormat::AnthropicChat,
                model_from_path: None,
                stream_from_path: false,
            })
        }
        ["v1", "complete"] => {
            post_only(method, wrong_method)?;
            Ok(Route::Call {
                op: RouteOp::Complete,
                inbound_format: ApiFormat::AnthropicText,
                model_from_path: None,
                stream_from_path: false,
            })
        }
        ["v1", "embeddings"] => {
            post_only(method, wrong_method)?;
            Ok(Route::Call {
                op: RouteOp::Embeddings,
                inbound_format: ApiFormat::Openai,
                model_from_path: None,
                stream_from_path: false,
            })
        }
        ["v1", "images", "generations"] | ["v1", "images", "edits"] => {
            post_only(method, wrong_method)?;
            Ok(Route::Call {
                op: RouteOp::ImageGenerations,
                inbound_format: ApiFormat::OpenaiImage,
                model_from_path: None,
                stream_from_path: false,
            })
        }
        ["v1beta", "models", rest] | ["v1", "models", rest] if rest.contains(':') => {
            post_only(method, wrong_method)?;
            let (model, action) = rest.split_once(':').unwrap_or((rest, ""));
            let stream = match action {
                "generateContent" => false,
                "streamGenerateContent" => true,
                _ => return Err(not_found),
            };
            let alt_sse = query.map(|q| q.contains("alt=sse")).unwrap_or(false);
            Ok(Route::Call {
                op: RouteOp::GenerateContent,
                inbound_format: ApiFormat::GoogleAi,
                model_from_path: Some(model.to_string()),
                stream_from_path: stream || alt_sse,
            })
        }
        _ => Err(not_found),
    }
}

fn post_only(method: &Method, err: RouteError) -> Result<(), RouteError> {
    if method == Method::POST { Ok(()) } else { Err(err) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completions_route() {
        let route = classify_route(&Method::POST, "v1/chat/completions", None).unwrap();
        assert!(matches!(
            route,
            Route::Call {
                op: RouteOp::ChatCompletions,
                inbound_format: ApiFormat::Openai,
                ..
            }
        ));
    }

    #[test]
    fn google_stream_route_extracts_model() {
        let route = classify_route(
            &Method::POST,
            "v1beta/models/gemini-2.5-flash:streamGenerateContent",
            Some("alt=sse&key=abc"),
        )
        .unwrap();
        let Route::Call {
            model_from_path,
            stream_from_path,
            op,
            ..
        } = route
        else {
            panic!("expected call route");
        };
        assert_eq!(op, RouteOp::GenerateContent);
        assert_eq!(model_from_path.as_deref(), Some("gemini-2.5-flash"));
        assert!(stream_from_path);
    }

    #[test]
    fn models_requires_get() {
        assert!(classify_route(&Method::GET, "v1/models", None).is_ok());
        assert_eq!(
            classify_route(&Method::POST, "v1/models", None).unwrap_err().status,
            405
        );
    }

    #[test]
    fn unknown_path_is_404() {
        assert_eq!(
            classify_route(&Method::POST, "v2/other", None).unwrap_err().status,
            404
        );
    }
}
