//! Matching and extraction against captured traffic
//!
//! Runs a template's matchers and extractors over a request/response pair
//! that was recorded elsewhere, without sending anything.

use crate::dsl::{DslEvaluator, Evaluator, VarMap};
use crate::error::EngineResult;
use crate::executor::run_extractors;
use crate::extractor::Extractor;
use crate::generator::TargetInfo;
use crate::matcher::Matcher;
use crate::packet::RawPacket;
use crate::result::{ExchangeRecord, ExtractedValue};
use crate::scope::{EvalContext, MaterialCache};
use crate::template::{Template, TemplateRequests};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OfflineOutcome {
    pub matched: bool,
    pub extracted: IndexMap<String, ExtractedValue>,
}

impl Template {
    /// Match and extract against one captured exchange
    pub fn match_and_extract(&self, request: Option<&[u8]>, response: &[u8], is_https: bool) -> OfflineOutcome {
        self.match_and_extract_with(&DslEvaluator::new(), &VarMap::new(), request, response, is_https)
    }

    pub fn match_and_extract_with(
        &self,
        evaluator: &dyn Evaluator,
        vars: &VarMap,
        request: Option<&[u8]>,
        response: &[u8],
        is_https: bool,
    ) -> OfflineOutcome {
        let request = request.unwrap_or_default();
        let url = RawPacket::parse(request).request_url(is_https).unwrap_or_default();

        let mut base = TargetInfo::parse(&url).map(|info| info.to_vars()).unwrap_or_default();
        base.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut resolved = self.variables.to_map(&base, evaluator);

        let exchanges = vec![ExchangeRecord {
            index: 1,
            url,
            is_https,
            request: request.to_vec(),
            response: response.to_vec(),
            ..Default::default()
        }];
        let cache = MaterialCache::new(Duration::from_secs(1));

        let sections: Vec<(Option<&Matcher>, &[Extractor])> = match &self.requests {
            TemplateRequests::Http(sequences) => sequences
                .iter()
                .map(|s| (s.matcher.as_ref(), s.extractors.as_slice()))
                .collect(),
            TemplateRequests::Network(sequences) => sequences
                .iter()
                .map(|s| (s.matcher.as_ref(), s.extractors.as_slice()))
                .collect(),
        };

        let mut outcome = OfflineOutcome::default();
        for (matcher, extractors) in sections {
            let results = {
                let ctx = EvalContext::new(&exchanges, &resolved, evaluator, &cache);
                run_extractors(extractors, &ctx, exchanges.first())
            };
            let mut found = false;
            for (extractor, value) in results {
                // Extracted values are visible to matchers, as on a live run
                resolved.insert(extractor.name.clone(), Value::String(value.to_string()));
                if !extractor.internal {
                    found = true;
                    outcome.extracted.insert(extractor.name.clone(), value);
                }
            }
            outcome.matched |= match matcher {
                Some(matcher) => {
                    let ctx = EvalContext::new(&exchanges, &resolved, evaluator, &cache);
                    matcher.execute(&ctx, exchanges.first())
                }
                None => found,
            };
        }
        outcome
    }
}

/// Load a template from YAML text and run it against one captured exchange
pub fn match_response(
    yaml: &str,
    request: Option<&[u8]>,
    response: &[u8],
    is_https: bool,
) -> EngineResult<OfflineOutcome> {
    let template = Template::from_yaml(yaml)?;
    Ok(template.match_and_extract(request, response, is_https))
}
