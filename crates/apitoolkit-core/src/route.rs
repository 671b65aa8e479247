//! Route templates and path parameters.
//!
//! Routers that know which template matched a request can say so by
//! inserting [`MatchedRoute`] and [`RouteParams`] into the request
//! extensions. When only the template is known, the parameters are derived
//! with [`path_params_from_template`].

use std::collections::BTreeMap;

/// The route template a router matched, e.g. `/users/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRoute(pub String);

impl MatchedRoute {
    /// Create from any string-like template.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// The template text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Path parameters a router bound while matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams(pub BTreeMap<String, String>);

impl<K, V> FromIterator<(K, V)> for RouteParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Name bound by a template segment, if it is a parameter.
///
/// Both `{name}` and `:name` are recognized.
fn param_name(segment: &str) -> Option<&str> {
    if let Some(inner) = segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
    {
        return Some(inner).filter(|n| !n.is_empty());
    }
    segment.strip_prefix(':').filter(|n| !n.is_empty())
}

/// Derive path parameters by pairing template and path segments.
///
/// Any query string on `path` is ignored. When the two have a different
/// number of segments, pairing stops at the shorter one.
///
/// ```
/// use apitoolkit_core::route::path_params_from_template;
///
/// let params = path_params_from_template("/users/{userId}/orders/{orderId}", "/users/123/orders/456");
/// assert_eq!(params["userId"], "123");
/// assert_eq!(params["orderId"], "456");
/// ```
pub fn path_params_from_template(template: &str, path: &str) -> BTreeMap<String, String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    template
        .split('/')
        .zip(path.split('/'))
        .filter_map(|(pattern, value)| {
            param_name(pattern).map(|name| {
                let value = urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string());
                (name.to_string(), value)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_named_segments() {
        let params =
            path_params_from_template("/users/{userId}/orders/{orderId}", "/users/123/orders/456");
        assert_eq!(params.len(), 2);
        assert_eq!(params["userId"], "123");
        assert_eq!(params["orderId"], "456");
    }

    #[test]
    fn test_static_template_has_no_params() {
        assert!(path_params_from_template("/users/all", "/users/all").is_empty());
    }

    #[test]
    fn test_colon_style_params() {
        let params = path_params_from_template("/items/:id", "/items/9");
        assert_eq!(params["id"], "9");
    }

    #[test]
    fn test_mismatched_lengths_pair_up_to_shorter() {
        let params = path_params_from_template("/a/{x}/b/{y}", "/a/1");
        assert_eq!(params.len(), 1);
        assert_eq!(params["x"], "1");

        let params = path_params_from_template("/a/{x}", "/a/1/extra/2");
        assert_eq!(params.len(), 1);
        assert_eq!(params["x"], "1");
    }

    #[test]
    fn test_query_is_ignored_and_values_decoded() {
        let params = path_params_from_template("/files/{name}", "/files/a%20b.txt?download=1");
        assert_eq!(params["name"], "a b.txt");
    }

    #[test]
    fn test_empty_braces_are_literal() {
        assert!(path_params_from_template("/x/{}", "/x/1").is_empty());
    }

    #[test]
    fn test_route_params_collect() {
        let params: RouteParams = [("id", "7")].into_iter().collect();
        assert_eq!(params.0["id"], "7");
    }
}
