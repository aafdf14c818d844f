//! Image reference decomposition.
//!
//! Splits an exporter's `name` attribute (`[registry/][path/]name[:tag]`)
//! into the four label values used by the history metrics.

use crate::error::ParseError;

/// Label names for the decomposed reference, in emission order.
pub const IMAGE_LABELS: [&str; 4] = ["registry", "path", "name", "tag"];

/// Tag assumed when the reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// A decomposed image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub path: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse an image FQN.
    ///
    /// An empty string yields `Ok(None)`. The tag separator is a colon after
    /// the last `/`; a colon inside the first segment is part of the registry
    /// host (`localhost:5000/app`). Any other colon is rejected.
    pub fn parse(fqn: &str) -> Result<Option<ImageRef>, ParseError> {
        if fqn.is_empty() {
            return Ok(None);
        }

        // Only colons after the last '/' separate a tag. A single colon before
        // it is a registry port, so `localhost:5000/app` keeps tag `latest`.
        let tail_start = fqn.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match fqn[tail_start..].matches(':').count() {
            0 => (fqn, DEFAULT_TAG),
            1 => {
                let sep = tail_start + fqn[tail_start..].find(':').unwrap_or(0);
                let tag = &fqn[sep + 1..];
                (&fqn[..sep], if tag.is_empty() { DEFAULT_TAG } else { tag })
            }
            _ => {
                return Err(ParseError::UnsupportedImageFqn {
                    fqn: fqn.to_string(),
                    reason: "more than one tag separator",
                })
            }
        };

        let segments: Vec<&str> = repository.split('/').collect();
        if segments.is_empty() {
            return Err(ParseError::InvalidImageFqn { fqn: fqn.to_string() });
        }

        if segments.len() == 1 {
            return Ok(Some(ImageRef {
                name: segments[0].to_string(),
                tag: tag.to_string(),
                ..Default::default()
            }));
        }

        // Only the registry host may carry a colon (its port).
        if segments[1..].iter().any(|s| s.contains(':')) {
            return Err(ParseError::UnsupportedImageFqn {
                fqn: fqn.to_string(),
                reason: "colon inside a path segment",
            });
        }

        let last = segments.len() - 1;
        Ok(Some(ImageRef {
            registry: segments[0].to_string(),
            path: segments[1..last].join("/"),
            name: segments[last].to_string(),
            tag: tag.to_string(),
        }))
    }

    /// Label values in [`IMAGE_LABELS`] order.
    pub fn label_values(&self) -> [String; 4] {
        [
            self.registry.clone(),
            self.path.clone(),
            self.name.clone(),
            self.tag.clone(),
        ]
    }

    /// Label values for an optional reference; an absent image yields four
    /// empty values.
    pub fn values_or_empty(image: Option<&ImageRef>) -> [String; 4] {
        image.map(ImageRef::label_values).unwrap_or_default()
    }
}
