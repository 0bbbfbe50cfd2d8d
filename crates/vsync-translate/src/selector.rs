//! Label selector translation
//!
//! Selectors written against virtual labels must be rewritten with the same
//! key conversion as the labels themselves, otherwise a virtual selector
//! would never match its translated host objects.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::naming::NamingPolicy;

fn rewrite(selector: &LabelSelector, convert: impl Fn(&str) -> String) -> LabelSelector {
    LabelSelector {
        match_labels: selector.match_labels.as_ref().map(|labels| {
            labels
                .iter()
                .map(|(k, v)| (convert(k), v.clone()))
                .collect::<BTreeMap<_, _>>()
        }),
        match_expressions: selector
            .match_expressions
            .as_ref()
            .filter(|exprs| !exprs.is_empty())
            .map(|exprs| {
                exprs
                    .iter()
                    .map(|r| LabelSelectorRequirement {
                        key: convert(&r.key),
                        operator: r.operator.clone(),
                        values: r.values.clone(),
                    })
                    .collect()
            }),
    }
}

/// Rewrite a selector for namespaced host objects
pub fn translate_label_selector(
    naming: &NamingPolicy,
    selector: Option<&LabelSelector>,
) -> Option<LabelSelector> {
    selector.map(|s| rewrite(s, |k| naming.label_key(k)))
}

/// Rewrite a selector for cluster-scoped host objects
pub fn translate_label_selector_cluster(
    naming: &NamingPolicy,
    selector: Option<&LabelSelector>,
) -> Option<LabelSelector> {
    selector.map(|s| rewrite(s, |k| naming.label_key_cluster(k)))
}

/// Combine selectors: later `matchLabels` win on key clashes, expressions accumulate
pub fn merge_label_selectors<'a>(
    selectors: impl IntoIterator<Item = Option<&'a LabelSelector>>,
) -> LabelSelector {
    let mut out = LabelSelector::default();
    for selector in selectors.into_iter().flatten() {
        for (k, v) in selector.match_labels.iter().flatten() {
            out.match_labels
                .get_or_insert_with(BTreeMap::new)
                .insert(k.clone(), v.clone());
        }
        for expr in selector.match_expressions.iter().flatten() {
            out.match_expressions
                .get_or_insert_with(Vec::new)
                .push(expr.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some([("app".to_string(), "web".to_string())].into()),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["db".to_string()]),
            }]),
        }
    }

    #[test]
    fn keys_are_converted_like_labels() {
        let naming = NamingPolicy::new("suffix", "test-ns");
        let translated = translate_label_selector(&naming, Some(&selector())).unwrap();
        let labels = translated.match_labels.unwrap();
        assert_eq!(labels[&naming.label_key("app")], "web");
        let exprs = translated.match_expressions.unwrap();
        assert_eq!(exprs[0].key, naming.label_key("tier"));
        assert_eq!(exprs[0].operator, "In");

        let cluster = translate_label_selector_cluster(&naming, Some(&selector())).unwrap();
        assert!(cluster.match_labels.unwrap().contains_key(&naming.label_key_cluster("app")));

        assert!(translate_label_selector(&naming, None).is_none());
    }

    #[test]
    fn empty_expressions_are_dropped() {
        let naming = NamingPolicy::new("suffix", "test-ns");
        let s = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![]),
        };
        let translated = translate_label_selector(&naming, Some(&s)).unwrap();
        assert!(translated.match_labels.is_none());
        assert!(translated.match_expressions.is_none());
    }

    #[test]
    fn merge_combines_labels_and_expressions() {
        let other = LabelSelector {
            match_labels: Some([("app".to_string(), "api".to_string())].into()),
            match_expressions: None,
        };
        let merged = merge_label_selectors([Some(&selector()), None, Some(&other)]);
        assert_eq!(merged.match_labels.unwrap()["app"], "api");
        assert_eq!(merged.match_expressions.unwrap().len(), 1);
    }
}
