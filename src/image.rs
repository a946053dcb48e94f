//! image url construction for the `/image` command path.
//!
//! nothing here touches the network: the url is resolved later by whatever
//! renders the turn.

use rand::Rng;

/// seeds are drawn from `[0, SEED_RANGE)` when the caller gives none.
pub const SEED_RANGE: u32 = 1_000_000;

/// fixed rendering options for the image endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    pub base_url: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub nologo: bool,
    pub enhance: bool,
    pub private: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gen.pollinations.ai".to_string(),
            model: "zimage".to_string(),
            width: 1024,
            height: 1024,
            nologo: true,
            enhance: true,
            private: false,
        }
    }
}

impl ImageConfig {
    pub fn request(&self, prompt: impl Into<String>, seed: Option<u32>) -> ImageRequest<'_> {
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..SEED_RANGE));
        ImageRequest { config: self, prompt: prompt.into(), seed }
    }

    pub fn build_url(&self, prompt: &str, seed: Option<u32>) -> String {
        self.request(prompt, seed).url()
    }
}

/// one fully-parameterized image request; renders to a single url.
#[derive(Clone, Debug)]
pub struct ImageRequest<'a> {
    config: &'a ImageConfig,
    pub prompt: String,
    pub seed: u32,
}

impl ImageRequest<'_> {
    pub fn url(&self) -> String {
        let c = self.config;
        let mut url = format!(
            "{}/image/{}?model={}&width={}&height={}&seed={}",
            c.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.prompt),
            urlencoding::encode(&c.model),
            c.width,
            c.height,
            self.seed,
        );
        for (flag, on) in [("nologo", c.nologo), ("enhance", c.enhance), ("private", c.private)] {
            if on {
                url.push('&');
                url.push_str(flag);
                url.push_str("=true");
            }
        }
        url
    }
}

/// build an image url with the default endpoint options.
pub fn build_image_url(prompt: &str, seed: Option<u32>) -> String {
    ImageConfig::default().build_url(prompt, seed)
}
