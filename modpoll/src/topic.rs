//! Maps device names to MQTT topics and back.

use rumqttc::mqttbytes::valid_topic;

use crate::Error;

pub const PLACEHOLDER: &str = "{{device_name}}";

pub const DEFAULT_PUBLISH_PATTERN: &str = "modpoll/{{device_name}}/data";
pub const DEFAULT_SUBSCRIBE_PATTERN: &str = "modpoll/{{device_name}}/set";
pub const DEFAULT_DIAGNOSTICS_PATTERN: &str = "modpoll/{{device_name}}/diagnostics";

/// A topic template with exactly one [`PLACEHOLDER`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicPattern {
    prefix: String,
    suffix: String,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> crate::Result<Self> {
        let invalid = |reason| Error::InvalidTopicPattern {
            pattern: pattern.to_owned(),
            reason,
        };

        let (prefix, suffix) = pattern
            .split_once(PLACEHOLDER)
            .ok_or_else(|| invalid("missing {{device_name}} placeholder"))?;
        if suffix.contains(PLACEHOLDER) {
            return Err(invalid("more than one {{device_name}} placeholder"));
        }
        if !valid_topic(&format!("{prefix}x{suffix}")) {
            return Err(invalid("wildcards are not allowed"));
        }

        Ok(Self {
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        })
    }

    pub fn expand(&self, device_name: &str) -> String {
        format!("{}{}{}", self.prefix, device_name, self.suffix)
    }

    /// The MQTT filter matching every expansion of this pattern: the segment
    /// holding the placeholder becomes `+`.
    ///
    /// A placeholder sharing its segment with other text (`dev-{{device_name}}`)
    /// still yields a `+` for the whole segment; [`Self::match_device`] does
    /// the exact check.
    pub fn subscription_filter(&self) -> String {
        let head = match self.prefix.rfind('/') {
            Some(i) => &self.prefix[..=i],
            None => "",
        };
        let tail = match self.suffix.find('/') {
            Some(i) => &self.suffix[i..],
            None => "",
        };
        format!("{head}+{tail}")
    }

    /// Extracts the device name from a topic produced by [`Self::expand`].
    ///
    /// The name must be non-empty and a single topic level.
    pub fn match_device<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let name = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.prefix, PLACEHOLDER, self.suffix)
    }
}

/// The three patterns a bridge publishes and listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicRouter {
    pub publish: TopicPattern,
    pub subscribe: TopicPattern,
    pub diagnostics: TopicPattern,
}

impl TopicRouter {
    pub fn new(publish: &str, subscribe: &str, diagnostics: &str) -> crate::Result<Self> {
        Ok(Self {
            publish: TopicPattern::new(publish)?,
            subscribe: TopicPattern::new(subscribe)?,
            diagnostics: TopicPattern::new(diagnostics)?,
        })
    }

    /// Builds the router from the deprecated single topic prefix, which
    /// overrides the publish and subscribe patterns.
    pub fn with_prefix(prefix: &str, diagnostics: &str) -> crate::Result<Self> {
        let prefix = prefix.trim_end_matches('/');
        Self::new(
            &format!("{prefix}/{PLACEHOLDER}"),
            &format!("{prefix}/{PLACEHOLDER}/set"),
            diagnostics,
        )
    }
}

impl Default for TopicRouter {
    fn default() -> Self {
        let pattern = |p: &str| {
            let (prefix, suffix) = p.split_once(PLACEHOLDER).unwrap_or((p, ""));
            TopicPattern {
                prefix: prefix.to_owned(),
                suffix: suffix.to_owned(),
            }
        };
        Self {
            publish: pattern(DEFAULT_PUBLISH_PATTERN),
            subscribe: pattern(DEFAULT_SUBSCRIBE_PATTERN),
            diagnostics: pattern(DEFAULT_DIAGNOSTICS_PATTERN),
        }
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn default_patterns() {
    let router = TopicRouter::default();
    assert_eq!(
        router,
        TopicRouter::new(
            DEFAULT_PUBLISH_PATTERN,
            DEFAULT_SUBSCRIBE_PATTERN,
            DEFAULT_DIAGNOSTICS_PATTERN
        )
        .unwrap()
    );
    assert_eq!(router.publish.expand("Meter1"), "modpoll/Meter1/data");
    assert_eq!(router.subscribe.subscription_filter(), "modpoll/+/set");
    assert_eq!(router.subscribe.match_device("modpoll/Meter1/set"), Some("Meter1"));
    assert_eq!(router.publish.to_string(), DEFAULT_PUBLISH_PATTERN);
}

#[test]
fn mismatched_topics_are_rejected() {
    let pattern = TopicPattern::new("modpoll/{{device_name}}/set").unwrap();
    assert_eq!(pattern.match_device("modpoll/Meter1/data"), None);
    assert_eq!(pattern.match_device("modpoll//set"), None);
    assert_eq!(pattern.match_device("modpoll/a/b/set"), None);
    assert_eq!(pattern.match_device("other/Meter1/set"), None);
}

#[test]
fn placeholder_anywhere() {
    let leading = TopicPattern::new("{{device_name}}/cmd").unwrap();
    assert_eq!(leading.subscription_filter(), "+/cmd");
    assert_eq!(leading.match_device("pump/cmd"), Some("pump"));

    let trailing = TopicPattern::new("site/{{device_name}}").unwrap();
    assert_eq!(trailing.subscription_filter(), "site/+");

    let embedded = TopicPattern::new("site/dev-{{device_name}}-x/set").unwrap();
    assert_eq!(embedded.subscription_filter(), "site/+/set");
    assert_eq!(embedded.match_device("site/dev-7-x/set"), Some("7"));
    assert_eq!(embedded.match_device("site/other/set"), None);
}

#[test]
fn invalid_patterns() {
    assert!(matches!(
        TopicPattern::new("modpoll/data"),
        Err(Error::InvalidTopicPattern { .. })
    ));
    assert!(matches!(
        TopicPattern::new("{{device_name}}/{{device_name}}"),
        Err(Error::InvalidTopicPattern { .. })
    ));
    assert!(matches!(
        TopicPattern::new("modpoll/+/{{device_name}}"),
        Err(Error::InvalidTopicPattern { .. })
    ));
}

#[test]
fn deprecated_prefix_overrides_publish_and_subscribe() {
    let router = TopicRouter::with_prefix("plant/", DEFAULT_DIAGNOSTICS_PATTERN).unwrap();
    assert_eq!(router.publish.expand("m1"), "plant/m1");
    assert_eq!(router.subscribe.expand("m1"), "plant/m1/set");
    assert_eq!(router.subscribe.match_device("plant/m1/set"), Some("m1"));
    assert_eq!(router.diagnostics.expand("m1"), "modpoll/m1/diagnostics");
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use rumqttc::mqttbytes::matches;

    proptest! {
        #[test]
        fn subscribe_topics_round_trip(
            prefix in "([a-z0-9]{1,6}/){0,3}",
            suffix in "(/[a-z0-9]{1,6}){0,3}",
            device in "[A-Za-z0-9_.-]{1,12}",
        ) {
            let pattern = TopicPattern::new(&format!("{prefix}{PLACEHOLDER}{suffix}")).unwrap();
            let topic = pattern.expand(&device);
            prop_assert_eq!(pattern.match_device(&topic), Some(device.as_str()));
            prop_assert!(matches(&topic, &pattern.subscription_filter()));
        }
    }
}
