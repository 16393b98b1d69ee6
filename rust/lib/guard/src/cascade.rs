//! Relation cascade.
//!
//! A model's policy also guards the nested routes through which its
//! instances can be written from the other side of a one-to-many relation:
//!
//! - `Parent hasMany Child`: creating and updating a child through the
//!   parent (`CreateRelated`, `UpdateRelated`) enforce the child's policy,
//!   whether or not the parent has a policy of its own.
//! - `Child belongsTo Parent`: if the parent declares the reciprocal "has"
//!   relation, creating and updating children through it enforce the
//!   child's policy, even when only the child side is declared.

use std::collections::BTreeSet;

use crate::hooks::EntryPoint;
use crate::registry::ModelRegistry;

/// One relation entry point guarded by another model's policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RelationBinding {
    /// Model exposing the nested route.
    pub owner: String,
    pub entry_point: EntryPoint,
    /// Model whose policy is enforced.
    pub target_type: String,
}

fn nested_writes(owner: &str, relation: &str, target_type: &str) -> [RelationBinding; 2] {
    [
        EntryPoint::CreateRelated(relation.to_string()),
        EntryPoint::UpdateRelated(relation.to_string()),
    ]
    .map(|entry_point| RelationBinding {
        owner: owner.to_string(),
        entry_point,
        target_type: target_type.to_string(),
    })
}

/// Derive all relation bindings for the registry. The result is sorted and
/// free of duplicates.
pub fn relation_bindings(registry: &ModelRegistry) -> Vec<RelationBinding> {
    let mut bindings = BTreeSet::new();

    for model in registry.models() {
        for relation in model.relations() {
            if relation.kind.is_has() {
                // Only the related type's policy matters here.
                if registry.resolve(&relation.related_type).is_ok() {
                    bindings.extend(nested_writes(
                        model.name(),
                        &relation.name,
                        &relation.related_type,
                    ));
                }
                continue;
            }

            if model.policy().is_none() {
                continue;
            }
            let Some(parent) = registry.get(&relation.related_type) else {
                continue;
            };
            let reciprocal = parent
                .relations()
                .iter()
                .find(|r| r.kind.is_has() && r.related_type == model.name());
            if let Some(reciprocal) = reciprocal {
                bindings.extend(nested_writes(parent.name(), &reciprocal.name, model.name()));
            }
        }
    }

    bindings.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{FieldMode, Policy};
    use crate::registry::{ModelDef, RelationDescriptor, RelationKind};

    fn guarded(name: &str) -> ModelDef {
        ModelDef::new(name).with_policy(Policy::fields(name, [("status", FieldMode::Always)]))
    }

    fn has_many(name: &str, target: &str, fk: &str) -> RelationDescriptor {
        RelationDescriptor::new(name, RelationKind::HasMany, target, fk)
    }

    fn belongs_to(name: &str, target: &str, fk: &str) -> RelationDescriptor {
        RelationDescriptor::new(name, RelationKind::BelongsTo, target, fk)
    }

    fn binding(owner: &str, entry_point: EntryPoint, target: &str) -> RelationBinding {
        RelationBinding {
            owner: owner.into(),
            entry_point,
            target_type: target.into(),
        }
    }

    #[test]
    fn has_relation_binds_nested_writes() {
        let registry = ModelRegistry::new([
            guarded("Product").with_relation(has_many("reviews", "Review", "productId")),
            guarded("Review"),
        ])
        .unwrap();

        assert_eq!(
            relation_bindings(&registry),
            vec![
                binding("Product", EntryPoint::CreateRelated("reviews".into()), "Review"),
                binding("Product", EntryPoint::UpdateRelated("reviews".into()), "Review"),
            ]
        );
    }

    #[test]
    fn unguarded_parent_still_guards_children() {
        // No policy on Product and no belongsTo on Review.
        let registry = ModelRegistry::new([
            ModelDef::new("Product").with_relation(has_many("reviews", "Review", "productId")),
            guarded("Review"),
        ])
        .unwrap();

        assert_eq!(
            relation_bindings(&registry),
            vec![
                binding("Product", EntryPoint::CreateRelated("reviews".into()), "Review"),
                binding("Product", EntryPoint::UpdateRelated("reviews".into()), "Review"),
            ]
        );
    }

    #[test]
    fn has_relation_to_unguarded_model_binds_nothing() {
        let registry = ModelRegistry::new([
            guarded("Product").with_relation(has_many("notes", "Note", "productId")),
            ModelDef::new("Note"),
        ])
        .unwrap();
        assert!(relation_bindings(&registry).is_empty());
    }

    #[test]
    fn belongs_to_binds_reciprocal_routes_on_parent() {
        // The parent declares no policy of its own.
        let registry = ModelRegistry::new([
            ModelDef::new("Product").with_relation(has_many("reviews", "Review", "productId")),
            guarded("Review").with_relation(belongs_to("product", "Product", "productId")),
        ])
        .unwrap();

        assert_eq!(
            relation_bindings(&registry),
            vec![
                binding("Product", EntryPoint::CreateRelated("reviews".into()), "Review"),
                binding("Product", EntryPoint::UpdateRelated("reviews".into()), "Review"),
            ]
        );
    }

    #[test]
    fn belongs_to_without_reciprocal_binds_nothing() {
        let registry = ModelRegistry::new([
            ModelDef::new("Product"),
            guarded("Review").with_relation(belongs_to("product", "Product", "productId")),
        ])
        .unwrap();
        assert!(relation_bindings(&registry).is_empty());
    }

    #[test]
    fn both_sides_declared_yield_each_route_once() {
        let registry = ModelRegistry::new([
            guarded("Product").with_relation(has_many("reviews", "Review", "productId")),
            guarded("Review").with_relation(belongs_to("product", "Product", "productId")),
        ])
        .unwrap();

        let bindings = relation_bindings(&registry);
        assert_eq!(bindings.len(), 2);
        assert!(bindings.iter().all(|b| b.owner == "Product" && b.target_type == "Review"));
    }

    #[test]
    fn has_one_counts_as_has() {
        let registry = ModelRegistry::new([
            guarded("Person").with_relation(RelationDescriptor::new(
                "profile",
                RelationKind::HasOne,
                "Profile",
                "personId",
            )),
            guarded("Profile"),
        ])
        .unwrap();
        assert_eq!(
            relation_bindings(&registry),
            vec![
                binding("Person", EntryPoint::CreateRelated("profile".into()), "Profile"),
                binding("Person", EntryPoint::UpdateRelated("profile".into()), "Profile"),
            ]
        );
    }
}
