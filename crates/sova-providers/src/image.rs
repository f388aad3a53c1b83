//! Image generation through a URL-rendering service

use rand::Rng;
use sova_storage::ImageEngine;

pub const MAX_SEED: u32 = 100_000;

#[derive(Debug, Clone)]
pub struct ImageUrlBuilder {
    endpoint: String,
    width: u32,
    height: u32,
}

impl Default for ImageUrlBuilder {
    fn default() -> Self {
        Self::from_config(&sova_config::ImageConfig::default())
    }
}

impl ImageUrlBuilder {
    pub fn from_config(config: &sova_config::ImageConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            width: config.width,
            height: config.height,
        }
    }

    pub fn build(&self, prompt: &str, engine: &ImageEngine, seed: u32) -> String {
        format!(
            "{}/{}?model={}&seed={}&width={}&height={}&nologo=true",
            self.endpoint,
            urlencoding::encode(prompt.trim()),
            urlencoding::encode(&engine.0),
            seed,
            self.width,
            self.height
        )
    }

    /// URL with a fresh seed in `0..=100000`.
    pub fn build_random(&self, prompt: &str, engine: &ImageEngine) -> String {
        let seed = rand::thread_rng().gen_range(0..=MAX_SEED);
        self.build(prompt, engine, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_encoded_url() {
        let builder = ImageUrlBuilder::default();
        let url = builder.build("a red fox & moon", &ImageEngine("flux".to_string()), 42);
        assert_eq!(
            url,
            "https://image.pollinations.ai/prompt/a%20red%20fox%20%26%20moon?model=flux&seed=42&width=1024&height=1024&nologo=true"
        );
    }

    #[test]
    fn random_seed_stays_in_range() {
        let builder = ImageUrlBuilder::default();
        let url = builder.build_random("cat", &ImageEngine("turbo".to_string()));
        let seed: u32 = url
            .split("seed=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .and_then(|s| s.parse().ok())
            .expect("seed");
        assert!(seed <= MAX_SEED);
        assert!(url.contains("model=turbo"));
    }
}
