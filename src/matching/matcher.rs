use super::normalize::NameNormalizer;
use super::similarity::similarity;
use crate::catalog_store::{
    CanonicalEntity, CatalogStore, EntityKind, MatchCandidate, SourceEntity, UnlinkedFilter,
};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::price_stage::PriceStage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_AUTO_LINK_THRESHOLD: f64 = 0.8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingSummary {
    pub matched: usize,
    pub unmatched: usize,
}

/// Candidate with its names already tokenized.
struct PreparedCandidate {
    id: i64,
    parent_id: Option<i64>,
    token_sets: Vec<Vec<String>>,
}

enum MatchOutcome {
    Linked { canonical_id: i64, score: f64 },
    BelowThreshold { best_score: f64 },
    Skipped,
}

/// Proposes and auto-applies canonical links for unlinked source entities.
pub struct EntityMatcher {
    store: Arc<dyn CatalogStore>,
    normalizer: NameNormalizer,
    threshold: f64,
}

impl EntityMatcher {
    pub fn new(store: Arc<dyn CatalogStore>, normalizer: NameNormalizer, threshold: f64) -> Self {
        EntityMatcher {
            store,
            normalizer,
            threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn prepare_candidates(&self, kind: EntityKind) -> EngineResult<Vec<PreparedCandidate>> {
        let candidates = self.store.list_canonical(kind)?;
        Ok(candidates
            .into_iter()
            .map(|candidate| self.prepare(candidate))
            .collect())
    }

    fn prepare(&self, candidate: CanonicalEntity) -> PreparedCandidate {
        let mut names = candidate.names;
        if candidate.kind == EntityKind::PriceStage {
            // Registry spellings make "farm-gate" land on PRODUCER
            if let Some(stage) = names.iter().find_map(|n| PriceStage::from_code(n)) {
                names.extend(stage.synonyms().into_iter().map(str::to_string));
            }
        }
        let token_sets = names
            .iter()
            .map(|name| self.normalizer.tokens(name))
            .filter(|tokens| !tokens.is_empty())
            .collect();
        PreparedCandidate {
            id: candidate.id,
            parent_id: candidate.parent_id,
            token_sets,
        }
    }

    /// Canonical country of the source country owning a source market.
    fn market_scope(
        &self,
        entity: &SourceEntity,
        cache: &mut HashMap<i64, Option<i64>>,
    ) -> EngineResult<Option<i64>> {
        let Some(parent_id) = entity.parent_id else {
            return Ok(None);
        };
        if let Some(scope) = cache.get(&parent_id) {
            return Ok(*scope);
        }
        let scope = self
            .store
            .get_source_entity(parent_id)?
            .filter(|parent| parent.kind == EntityKind::Country)
            .and_then(|parent| parent.canonical_id);
        cache.insert(parent_id, scope);
        Ok(scope)
    }

    /// Best-scoring candidate, ties going to the lowest canonical id.
    fn best_candidate<'a>(
        &self,
        entity: &SourceEntity,
        candidates: impl Iterator<Item = &'a PreparedCandidate>,
    ) -> Option<(i64, f64)> {
        let source_tokens: Vec<Vec<String>> = entity
            .display_names()
            .into_iter()
            .map(|name| self.normalizer.tokens(name))
            .filter(|tokens| !tokens.is_empty())
            .collect();

        let mut best: Option<(i64, f64)> = None;
        for candidate in candidates {
            let score = source_tokens
                .iter()
                .flat_map(|s| candidate.token_sets.iter().map(move |c| similarity(s, c)))
                .fold(0.0, f64::max);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((candidate.id, score)),
            }
        }
        best
    }

    fn scoped<'a>(
        &self,
        kind: EntityKind,
        entity: &SourceEntity,
        candidates: &'a [PreparedCandidate],
        market_scopes: &mut HashMap<i64, Option<i64>>,
    ) -> EngineResult<Vec<&'a PreparedCandidate>> {
        let scope = match kind {
            EntityKind::Variety => entity.canonical_id,
            EntityKind::Market => self.market_scope(entity, market_scopes)?,
            _ => None,
        };
        Ok(match (kind, scope) {
            (EntityKind::Variety, None) => Vec::new(),
            (_, Some(parent)) => candidates
                .iter()
                .filter(|c| c.parent_id == Some(parent))
                .collect(),
            (_, None) => candidates.iter().collect(),
        })
    }

    fn match_entity(
        &self,
        kind: EntityKind,
        entity: &SourceEntity,
        candidates: &[PreparedCandidate],
        market_scopes: &mut HashMap<i64, Option<i64>>,
    ) -> EngineResult<MatchOutcome> {
        let (_, _, is_manual) = entity.link_for(kind);
        if is_manual {
            return Ok(MatchOutcome::Skipped);
        }

        let scoped = self.scoped(kind, entity, candidates, market_scopes)?;
        let Some((canonical_id, score)) = self.best_candidate(entity, scoped.into_iter()) else {
            return Ok(MatchOutcome::BelowThreshold { best_score: 0.0 });
        };

        if score >= self.threshold {
            // The write re-checks is_manual, so a concurrent operator link wins
            if self
                .store
                .try_auto_link(kind, entity.id, Some(canonical_id), score)?
            {
                return Ok(MatchOutcome::Linked {
                    canonical_id,
                    score,
                });
            }
            return Ok(MatchOutcome::Skipped);
        }

        self.store.try_auto_link(kind, entity.id, None, score)?;
        Ok(MatchOutcome::BelowThreshold { best_score: score })
    }

    /// Match every unlinked, non-manual source entity of `kind`.
    ///
    /// A failure on one entity is logged and counted as unmatched.
    pub fn run_matching(&self, kind: EntityKind) -> EngineResult<MatchingSummary> {
        let candidates = self.prepare_candidates(kind)?;
        let pending = self.store.find_unlinked(kind, &UnlinkedFilter::default())?;
        let mut market_scopes = HashMap::new();
        let mut summary = MatchingSummary::default();

        for entity in &pending {
            match self.match_entity(kind, entity, &candidates, &mut market_scopes) {
                Ok(MatchOutcome::Linked {
                    canonical_id,
                    score,
                }) => {
                    debug!(
                        "Linked {} source entity {} ('{}') to {} with score {:.3}",
                        kind, entity.id, entity.name, canonical_id, score
                    );
                    metrics::record_matching_outcome(kind.to_db_str(), "matched");
                    summary.matched += 1;
                }
                Ok(MatchOutcome::BelowThreshold { best_score }) => {
                    debug!(
                        "No {} candidate for source entity {} ('{}'), best score {:.3}",
                        kind, entity.id, entity.name, best_score
                    );
                    metrics::record_matching_outcome(kind.to_db_str(), "unmatched");
                    summary.unmatched += 1;
                }
                Ok(MatchOutcome::Skipped) => {
                    debug!(
                        "Source entity {} was linked manually meanwhile, leaving it alone",
                        entity.id
                    );
                    metrics::record_matching_outcome(kind.to_db_str(), "skipped");
                    summary.unmatched += 1;
                }
                Err(e) => {
                    warn!("Matching {} source entity {} failed: {}", kind, entity.id, e);
                    metrics::record_matching_outcome(kind.to_db_str(), "error");
                    summary.unmatched += 1;
                }
            }
        }

        info!(
            "Matching {}: {} matched, {} unmatched",
            kind, summary.matched, summary.unmatched
        );
        Ok(summary)
    }

    /// Ranked candidates for one source entity, for manual review.
    pub fn suggest(
        &self,
        kind: EntityKind,
        source_entity_id: i64,
        limit: usize,
    ) -> EngineResult<Vec<MatchCandidate>> {
        let entity = self
            .store
            .get_source_entity(source_entity_id)?
            .filter(|e| e.kind == kind.source_entity_kind())
            .ok_or(EngineError::NotFound {
                kind,
                id: source_entity_id,
            })?;
        let (_, _, is_manual) = entity.link_for(kind);
        let candidates = self.prepare_candidates(kind)?;
        let scoped = self.scoped(kind, &entity, &candidates, &mut HashMap::new())?;

        let mut ranked: Vec<MatchCandidate> = scoped
            .into_iter()
            .map(|candidate| MatchCandidate {
                source_entity_id,
                canonical_candidate_id: candidate.id,
                score: self
                    .best_candidate(&entity, std::iter::once(candidate))
                    .map_or(0.0, |(_, score)| score),
                is_manual,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.canonical_candidate_id.cmp(&b.canonical_candidate_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}
