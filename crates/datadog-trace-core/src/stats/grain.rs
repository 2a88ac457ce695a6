// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use crate::pb::Span;

/// Tags identifying a stats series, sorted by name.
pub type TagSet = BTreeMap<String, String>;

pub const VERSION_TAG: &str = "version";
pub const HTTP_STATUS_CODE_TAG: &str = "http.status_code";

/// Tags always added to the grain when present.
pub const DEFAULT_AGGREGATORS: [&str; 2] = [VERSION_TAG, HTTP_STATUS_CODE_TAG];

/// Builds the grain `env:E,resource:R,service:S[,k:v...]` and its tag set.
/// Extra tags are sorted by name and empty values are skipped, so the
/// result does not depend on the iteration order of `extra`.
pub fn assemble_grain<'a, I>(env: &str, resource: &str, service: &str, extra: I) -> (String, TagSet)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let extra: BTreeMap<&str, &str> = extra.into_iter().filter(|(_, v)| !v.is_empty()).collect();
    let mut grain = format!("env:{env},resource:{resource},service:{service}");
    let mut tags = TagSet::new();
    tags.insert("env".to_string(), env.to_string());
    tags.insert("resource".to_string(), resource.to_string());
    tags.insert("service".to_string(), service.to_string());
    for (k, v) in extra {
        grain.push(',');
        grain.push_str(k);
        grain.push(':');
        grain.push_str(v);
        tags.insert(k.to_string(), v.to_string());
    }
    (grain, tags)
}

/// Grain of a span, reading `aggregators` from its meta.
pub fn span_grain(span: &Span, env: &str, aggregators: &[String]) -> (String, TagSet) {
    let extra = aggregators.iter().filter_map(|name| {
        span.meta
            .get(name)
            .map(|value| (name.as_str(), value.as_str()))
    });
    assemble_grain(env, &span.resource, &span.service, extra)
}

/// Key of a count: `name|measure|grain`.
pub fn grain_key(name: &str, measure: &str, grain: &str) -> String {
    format!("{name}|{measure}|{grain}")
}
