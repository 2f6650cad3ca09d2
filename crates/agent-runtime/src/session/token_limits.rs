//! Per-model context window sizes.

pub const DEFAULT_TOKEN_LIMIT: u64 = 1_048_576;

/// Returns the context token limit for the given model id.
pub fn token_limit(model: &str) -> u64 {
    match model {
        "gemini-1.5-pro" => 2_097_152,
        "gemini-1.5-flash"
        | "gemini-2.5-pro-preview-05-06"
        | "gemini-2.5-pro-preview-06-05"
        | "gemini-2.5-pro"
        | "gemini-2.5-flash-preview-05-20"
        | "gemini-2.5-flash"
        | "gemini-2.0-flash" => 1_048_576,
        "gemini-2.0-flash-preview-image-generation" => 32_000,
        "gemini-pro-vision" => 12_288,
        "embedding-001" => 2_048,
        _ => DEFAULT_TOKEN_LIMIT,
    }
}
