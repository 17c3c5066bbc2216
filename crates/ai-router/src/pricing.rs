//! Static per-provider price table.
//!
//! Prices are USD per 1K tokens, blended across prompt and completion.
//! Providers documented as free tier cost 0.

/// USD per 1K tokens for `(provider, model)`.
pub fn price_per_1k_tokens(provider: &str, model: &str) -> f64 {
    match provider {
        // Free-tier providers.
        "groq" | "huggingface" => 0.0,
        "gemini" => match model {
            m if m.contains("flash") => 0.000_15,
            m if m.contains("pro") => 0.002_5,
            _ => 0.000_5,
        },
        "kimi" => match model {
            m if m.contains("128k") => 0.008,
            m if m.contains("32k") => 0.003,
            _ => 0.001_5,
        },
        "qwen" => match model {
            m if m.contains("max") => 0.003,
            m if m.contains("plus") => 0.000_8,
            _ => 0.000_3,
        },
        "glm4" => match model {
            m if m.contains("flash") => 0.0,
            m if m.contains("plus") => 0.000_7,
            _ => 0.000_5,
        },
        _ => 0.0,
    }
}

pub fn cost_for(provider: &str, model: &str, tokens_used: u32) -> f64 {
    price_per_1k_tokens(provider, model) * tokens_used as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_providers_cost_nothing() {
        assert_eq!(cost_for("groq", "llama-3.1-8b-instant", 10_000), 0.0);
        assert_eq!(cost_for("huggingface", "any", 10_000), 0.0);
        assert_eq!(cost_for("glm4", "glm-4-flash", 10_000), 0.0);
    }

    #[test]
    fn paid_models_scale_with_tokens() {
        let one = cost_for("kimi", "moonshot-v1-128k", 1_000);
        let two = cost_for("kimi", "moonshot-v1-128k", 2_000);
        assert!(one > 0.0);
        assert!((two - one * 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_providers_default_to_zero() {
        assert_eq!(cost_for("somebody-else", "model", 5_000), 0.0);
    }
}
