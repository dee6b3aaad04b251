use std::sync::OnceLock;

use regex::Regex;

use crate::{ModelFamily, Service};

/// One prioritized classification table per service. First match wins; the
/// final entry is the service fallback and must match everything.
struct ServiceTable {
    service: Service,
    rules: Vec<(Regex, ModelFamily)>,
    fallback: ModelFamily,
}

fn tables() -> &'static [ServiceTable] {
    static TABLES: OnceLock<Vec<ServiceTable>> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn rule(pattern: &str, family: ModelFamily) -> (Regex, ModelFamily) {
    // Patterns are static and known-good; a broken one is a programming error
    // caught by the table test below.
    (
        Regex::new(pattern).unwrap_or_else(|err| panic!("bad classify pattern {pattern}: {err}")),
        family,
    )
}

fn build_tables() -> Vec<ServiceTable> {
    vec![
        ServiceTable {
            service: Service::Openai,
            rules: vec![
                rule(r"^gpt-5", ModelFamily::Gpt5),
                rule(r"^o3", ModelFamily::O3),
                rule(r"^o1-mini", ModelFamily::O1Mini),
                rule(r"^o1", ModelFamily::O1),
                rule(r"^gpt-4o", ModelFamily::Gpt4o),
                rule(r"^chatgpt-4o", ModelFamily::Gpt4o),
                rule(r"^gpt-4\.[15]", ModelFamily::Gpt4o),
                rule(r"^gpt-4-turbo", ModelFamily::Gpt4Turbo),
                rule(r"^gpt-4-\d{4}-preview", ModelFamily::Gpt4Turbo),
                rule(r"^gpt-4", ModelFamily::Gpt4),
                rule(r"^gpt-image", ModelFamily::GptImage),
                rule(r"^dall-e", ModelFamily::DallE),
                rule(r"^gpt-3\.5|^text-embedding", ModelFamily::Turbo),
            ],
            fallback: ModelFamily::Turbo,
        },
        ServiceTable {
            service: Service::Anthropic,
            rules: vec![
                rule(r"opus", ModelFamily::ClaudeOpus),
                rule(r"^claude-", ModelFamily::Claude),
            ],
            fallback: ModelFamily::Claude,
        },
        ServiceTable {
            service: Service::Aws,
            rules: vec![
                rule(r"^mistral\.", ModelFamily::AwsMistral),
                rule(r"opus", ModelFamily::AwsClaudeOpus),
            ],
            fallback: ModelFamily::AwsClaude,
        },
        ServiceTable {
            service: Service::Gcp,
            rules: vec![rule(r"opus", ModelFamily::GcpClaudeOpus)],
            fallback: ModelFamily::GcpClaude,
        },
        ServiceTable {
            service: Service::GoogleAi,
            rules: vec![
                rule(r"flash|lite", ModelFamily::GeminiFlash),
                rule(r"pro|ultra", ModelFamily::GeminiPro),
            ],
            fallback: ModelFamily::GeminiFlash,
        },
        ServiceTable {
            service: Service::MistralAi,
            rules: vec![
                rule(r"large|pixtral-large", ModelFamily::MistralLarge),
                rule(r"medium|magistral", ModelFamily::MistralMedium),
                rule(r"small|codestral|ministral|pixtral", ModelFamily::MistralSmall),
                rule(r"tiny|nemo|open-mistral-7b", ModelFamily::MistralTiny),
            ],
            fallback: ModelFamily::MistralSmall,
        },
        ServiceTable {
            service: Service::Openrouter,
            rules: vec![],
            fallback: ModelFamily::Openrouter,
        },
        ServiceTable {
            service: Service::Moonshot,
            rules: vec![],
            fallback: ModelFamily::Moonshot,
        },
        ServiceTable {
            service: Service::Qwen,
            rules: vec![],
            fallback: ModelFamily::Qwen,
        },
        ServiceTable {
            service: Service::Glm,
            rules: vec![],
            fallback: ModelFamily::Glm,
        },
        ServiceTable {
            service: Service::Cohere,
            rules: vec![],
            fallback: ModelFamily::Command,
        },
        ServiceTable {
            service: Service::Azure,
            rules: vec![
                rule(r"^gpt-image", ModelFamily::AzureGptImage),
                rule(r"^dall-e", ModelFamily::AzureDalle),
            ],
            fallback: ModelFamily::AzureGpt,
        },
    ]
}

/// `family(service, raw_model)` of the data model: deterministic, pure,
/// first match over the service's prioritized rules.
pub fn classify(service: Service, raw_model: &str) -> ModelFamily {
    let model = normalize_for_classification(service, raw_model);
    for table in tables() {
        if table.service != service {
            continue;
        }
        for (pattern, family) in &table.rules {
            if pattern.is_match(&model) {
                return *family;
            }
        }
        return table.fallback;
    }
    // Every service has a table; this arm exists only for totality.
    ModelFamily::Turbo
}

fn normalize_for_classification(service: Service, raw_model: &str) -> String {
    let mut model = raw_model.trim().to_ascii_lowercase();
    if service == Service::Aws {
        // Cross-region ("global.", "us.") and vendor ("anthropic.") prefixes
        // carry no family information.
        for prefix in ["global.", "us.", "eu.", "apac."] {
            if let Some(rest) = model.strip_prefix(prefix) {
                model = rest.to_string();
                break;
            }
        }
        if let Some(rest) = model.strip_prefix("anthropic.") {
            model = rest.to_string();
        }
    }
    if service == Service::Gcp {
        // GCP canonical ids are `<name>@<revision>`.
        if let Some((name, _revision)) = model.split_once('@') {
            model = name.to_string();
        }
    }
    model
}

/// Maps client-facing aliases to canonical upstream ids for a service.
///
/// AWS accepts both legacy (`claude-3-sonnet-20240229`) and new
/// (`claude-sonnet-4-20250514`) Claude id shapes; GCP wants `<name>@<revision>`.
/// Unknown ids pass through unchanged and classification falls back.
pub fn reassign_model(service: Service, raw_model: &str) -> String {
    let model = raw_model.trim();
    match service {
        Service::Anthropic => match model {
            "claude-3-5-sonnet-latest" => "claude-3-5-sonnet-20241022".to_string(),
            "claude-3-opus-latest" => "claude-3-opus-20240229".to_string(),
            "claude-opus-4-latest" => "claude-opus-4-1-20250805".to_string(),
            _ => model.to_string(),
        },
        Service::Aws => {
            let base = match model {
                "claude-3-5-sonnet-latest" => "anthropic.claude-3-5-sonnet-20241022-v2:0",
                "claude-v2" => "anthropic.claude-v2:1",
                other => {
                    if other.contains('.') {
                        return other.to_string();
                    }
                    return format!("anthropic.{other}");
                }
            };
            base.to_string()
        }
        Service::Gcp => {
            if model.contains('@') {
                model.to_string()
            } else {
                match model {
                    "claude-3-5-sonnet" | "claude-3-5-sonnet-latest" => {
                        "claude-3-5-sonnet@20240620".to_string()
                    }
                    "claude-3-opus" => "claude-3-opus@20240229".to_string(),
                    _ => model.to_string(),
                }
            }
        }
        Service::GoogleAi => match model {
            "gemini-flash-latest" => "gemini-2.5-flash".to_string(),
            "gemini-pro-latest" => "gemini-2.5-pro".to_string(),
            _ => model.to_string(),
        },
        _ => model.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_compile_and_cover_every_service() {
        for service in Service::all() {
            // Fallback path: an unknown id always classifies.
            let _ = classify(*service, "definitely-not-a-model");
        }
    }

    #[test]
    fn openai_priority_order() {
        assert_eq!(classify(Service::Openai, "gpt-5-mini"), ModelFamily::Gpt5);
        assert_eq!(classify(Service::Openai, "o3-mini"), ModelFamily::O3);
        assert_eq!(classify(Service::Openai, "o1-mini"), ModelFamily::O1Mini);
        assert_eq!(classify(Service::Openai, "gpt-4o-2024-08-06"), ModelFamily::Gpt4o);
        assert_eq!(
            classify(Service::Openai, "gpt-4-turbo-2024-04-09"),
            ModelFamily::Gpt4Turbo
        );
        assert_eq!(classify(Service::Openai, "gpt-4-0613"), ModelFamily::Gpt4);
        assert_eq!(classify(Service::Openai, "gpt-image-1"), ModelFamily::GptImage);
        assert_eq!(classify(Service::Openai, "gpt-3.5-turbo"), ModelFamily::Turbo);
        assert_eq!(classify(Service::Openai, "unknown-model"), ModelFamily::Turbo);
    }

    #[test]
    fn aws_prefixes_do_not_change_family() {
        assert_eq!(
            classify(Service::Aws, "global.anthropic.claude-opus-4-20250514-v1:0"),
            ModelFamily::AwsClaudeOpus
        );
        assert_eq!(
            classify(Service::Aws, "anthropic.claude-3-sonnet-20240229-v1:0"),
            ModelFamily::AwsClaude
        );
        assert_eq!(
            classify(Service::Aws, "mistral.mistral-large-2402-v1:0"),
            ModelFamily::AwsMistral
        );
    }

    #[test]
    fn gcp_revision_suffix_is_ignored() {
        assert_eq!(
            classify(Service::Gcp, "claude-3-opus@20240229"),
            ModelFamily::GcpClaudeOpus
        );
        assert_eq!(
            classify(Service::Gcp, "claude-3-5-sonnet@20240620"),
            ModelFamily::GcpClaude
        );
    }

    #[test]
    fn anthropic_alias_reassignment() {
        assert_eq!(
            reassign_model(Service::Anthropic, "claude-3-5-sonnet-latest"),
            "claude-3-5-sonnet-20241022"
        );
        assert_eq!(
            reassign_model(Service::Anthropic, "claude-3-5-sonnet-20241022"),
            "claude-3-5-sonnet-20241022"
        );
    }
}
