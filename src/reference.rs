use std::fmt;

pub const DEFAULT_REPOSITORY: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// A parsed `[repository/]image[:tag]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    repository: String,
    image: String,
    tag: String,
}

impl ImageReference {
    /// Splits user input on the first `:` into name and tag, defaulting the tag
    /// to `latest`. A name containing `/` names its repository; a bare name
    /// lives in `library`.
    pub fn parse(input: &str) -> Self {
        let (name, tag) = match input.split_once(':') {
            Some((name, tag)) => (name, tag),
            None => (input, DEFAULT_TAG),
        };

        let (repository, image) = match name.split_once('/') {
            Some((repository, image)) => (repository, image),
            None => (DEFAULT_REPOSITORY, name),
        };

        Self {
            repository: repository.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Auth scope requesting pull access to this reference.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}/{}:{},pull", self.repository, self.image, self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.image, self.tag)
    }
}
