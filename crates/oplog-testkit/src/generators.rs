//! Proptest generators for property-based testing.

use ciborium::value::Value;
use proptest::prelude::*;

use oplog::{Op, Operation, OpType, PropSet};
use oplog_core::SecretKey;
use oplog_keys::{KeyPurpose, KeyRecord, Scope};

/// A random signing key.
pub fn signing_key() -> impl Strategy<Value = SecretKey> {
    any::<[u8; 32]>().prop_map(SecretKey::signing_from_seed)
}

/// A random encryption key.
pub fn encryption_key() -> impl Strategy<Value = SecretKey> {
    any::<[u8; 32]>().prop_map(SecretKey::encryption_from_seed)
}

/// One of the operation codes.
pub fn op_code() -> impl Strategy<Value = &'static str> {
    prop::sample::select(OpType::ALL.iter().map(|t| t.code()).collect::<Vec<_>>())
}

/// An action type.
pub fn action_type() -> impl Strategy<Value = String> {
    "[a-z]{1,8}".prop_map(String::from)
}

/// A scope over the names produced by `names`, or `"*"`.
pub fn scope<S>(names: S) -> impl Strategy<Value = Scope>
where
    S: Strategy<Value = String> + 'static,
{
    prop_oneof![
        1 => Just(Scope::All),
        4 => prop::collection::btree_set(names, 0..4).prop_map(Scope::Only),
    ]
}

/// A permission scope over operation codes.
pub fn permissions() -> impl Strategy<Value = Scope> {
    scope(op_code().prop_map(String::from))
}

pub fn ring_level() -> impl Strategy<Value = u32> {
    0u32..4
}

/// What a key may do.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub ring_level: u32,
    pub permissions: Scope,
    pub allowed_actions: Scope,
}

impl Capabilities {
    /// Whether a key with these capabilities may add or manage `target`.
    pub fn covers(&self, target: &Capabilities) -> bool {
        target.ring_level >= self.ring_level
            && target.permissions.is_subset_of(&self.permissions)
            && target.allowed_actions.is_subset_of(&self.allowed_actions)
    }

    /// A record for `secret` carrying these capabilities.
    pub fn record(&self, name: &str, secret: &SecretKey, purpose: KeyPurpose) -> KeyRecord {
        KeyRecord::new(name, &secret.public(), [purpose])
            .ring_level(self.ring_level)
            .permissions(self.permissions.clone())
            .allowed_actions(self.allowed_actions.clone())
    }
}

impl Arbitrary for Capabilities {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (ring_level(), permissions(), scope(action_type()))
            .prop_map(|(ring_level, permissions, allowed_actions)| Capabilities {
                ring_level,
                permissions,
                allowed_actions,
            })
            .boxed()
    }
}

/// A CBOR value of the kind stored in properties.
pub fn prop_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Integer(n.into())),
        "[ -~]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

/// A property-set operation.
pub fn prop_set() -> impl Strategy<Value = Operation> {
    ("[a-z]{1,6}", prop_value()).prop_map(|(key, value)| Op::PropSet(PropSet { key, value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn test_capabilities_cover_themselves(caps: Capabilities) {
            prop_assert!(caps.covers(&caps));
        }

        #[test]
        fn test_all_scope_covers_anything(target: Capabilities) {
            let root = Capabilities {
                ring_level: 0,
                permissions: Scope::All,
                allowed_actions: Scope::All,
            };
            prop_assert!(root.covers(&target));
        }

        #[test]
        fn test_key_kinds_never_share_ids(s in signing_key(), e in encryption_key()) {
            prop_assert_ne!(s.id(), e.id());
        }

        #[test]
        fn test_op_codes_parse(code in op_code()) {
            prop_assert!(OpType::from_code(code).is_some());
        }
    }
}
