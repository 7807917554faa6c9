//! Embeds and the validating builder.
//!
//! The API rejects oversized embeds with an opaque 400; the builder enforces
//! the documented limits locally so the failure is a typed VALIDATION error
//! before anything hits the wire.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rich embed attached to a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedThumbnail>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,

    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedThumbnail {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

const MAX_TITLE: usize = 256;
const MAX_DESCRIPTION: usize = 4096;
const MAX_FIELDS: usize = 25;
const MAX_FIELD_NAME: usize = 256;
const MAX_FIELD_VALUE: usize = 1024;
const MAX_FOOTER: usize = 2048;
const MAX_AUTHOR: usize = 256;
const MAX_TOTAL: usize = 6000;

/// Builder enforcing the embed size limits.
#[derive(Debug, Clone, Default)]
pub struct EmbedBuilder {
    embed: Embed,
}

impl EmbedBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.embed.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.embed.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.embed.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn timestamp(mut self, iso8601: impl Into<String>) -> Self {
        self.embed.timestamp = Some(iso8601.into());
        self
    }

    #[must_use]
    pub const fn color(mut self, color: u32) -> Self {
        self.embed.color = Some(color);
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.embed.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    #[must_use]
    pub fn footer(mut self, text: impl Into<String>, icon_url: Option<String>) -> Self {
        self.embed.footer = Some(EmbedFooter {
            text: text.into(),
            icon_url,
        });
        self
    }

    #[must_use]
    pub fn image(mut self, url: impl Into<String>) -> Self {
        self.embed.image = Some(EmbedImage { url: url.into() });
        self
    }

    #[must_use]
    pub fn thumbnail(mut self, url: impl Into<String>) -> Self {
        self.embed.thumbnail = Some(EmbedThumbnail { url: url.into() });
        self
    }

    #[must_use]
    pub fn author(mut self, name: impl Into<String>, url: Option<String>) -> Self {
        self.embed.author = Some(EmbedAuthor {
            name: name.into(),
            url,
            icon_url: None,
        });
        self
    }

    /// Validate and produce the embed.
    ///
    /// # Errors
    ///
    /// `Error::Validation` naming the first violated limit.
    pub fn build(self) -> Result<Embed> {
        let embed = self.embed;

        check_len("embed title", embed.title.as_deref(), MAX_TITLE)?;
        check_len(
            "embed description",
            embed.description.as_deref(),
            MAX_DESCRIPTION,
        )?;

        if embed.fields.len() > MAX_FIELDS {
            return Err(Error::Validation(format!(
                "embed has {} fields, limit is {MAX_FIELDS}",
                embed.fields.len()
            )));
        }
        for field in &embed.fields {
            check_len("embed field name", Some(&field.name), MAX_FIELD_NAME)?;
            check_len("embed field value", Some(&field.value), MAX_FIELD_VALUE)?;
            if field.name.is_empty() || field.value.is_empty() {
                return Err(Error::Validation(
                    "embed field name and value must be non-empty".into(),
                ));
            }
        }
        check_len(
            "embed footer text",
            embed.footer.as_ref().map(|f| f.text.as_str()),
            MAX_FOOTER,
        )?;
        check_len(
            "embed author name",
            embed.author.as_ref().map(|a| a.name.as_str()),
            MAX_AUTHOR,
        )?;

        let total = embed.total_length();
        if total > MAX_TOTAL {
            return Err(Error::Validation(format!(
                "embed totals {total} characters, limit is {MAX_TOTAL}"
            )));
        }

        Ok(embed)
    }
}

impl Embed {
    /// Character count across every limited text surface.
    #[must_use]
    pub fn total_length(&self) -> usize {
        let mut total = 0;
        total += self.title.as_deref().map_or(0, count);
        total += self.description.as_deref().map_or(0, count);
        total += self.footer.as_ref().map_or(0, |f| count(&f.text));
        total += self.author.as_ref().map_or(0, |a| count(&a.name));
        for field in &self.fields {
            total += count(&field.name) + count(&field.value);
        }
        total
    }
}

fn count(s: &str) -> usize {
    s.chars().count()
}

fn check_len(what: &str, value: Option<&str>, limit: usize) -> Result<()> {
    if let Some(v) = value {
        let len = count(v);
        if len > limit {
            return Err(Error::Validation(format!(
                "{what} is {len} characters, limit is {limit}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_boundary_values() {
        let embed = EmbedBuilder::new()
            .title("t".repeat(256))
            .description("d".repeat(4096))
            .footer("f".repeat(1024), None)
            .build()
            .unwrap();
        assert_eq!(embed.total_length(), 256 + 4096 + 1024);
    }

    #[test]
    fn rejects_long_title() {
        let err = EmbedBuilder::new().title("x".repeat(257)).build();
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_26th_field() {
        let mut builder = EmbedBuilder::new();
        for i in 0..26 {
            builder = builder.field(format!("f{i}"), "v", false);
        }
        assert!(matches!(builder.build(), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_long_field_value() {
        let err = EmbedBuilder::new().field("name", "v".repeat(1025), false).build();
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_aggregate_overflow() {
        // Each surface individually legal; the sum is 6001.
        let err = EmbedBuilder::new()
            .title("t".repeat(256))
            .description("d".repeat(4096))
            .footer("f".repeat(1024), None)
            .field("n".repeat(256), "v".repeat(369), false)
            .build();
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn counts_chars_not_bytes() {
        // 256 multibyte chars in the title is still legal.
        let embed = EmbedBuilder::new().title("ü".repeat(256)).build().unwrap();
        assert_eq!(embed.total_length(), 256);
    }
}
