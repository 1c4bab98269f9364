//! # Payload Registry
//!
//! Maps recorded type names back to payload shapes. The outbox worker uses it
//! to prove a stored payload still deserializes before forwarding it; a type
//! name that resolves to nothing, or bytes that no longer fit the shape, are
//! permanent failures for that row.

use super::{EnvelopeType, Message};
use crate::serialization::{SerializationError, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Decoder = Arc<dyn Fn(&[u8]) -> Result<(), SerializationError> + Send + Sync>;

/// Registry of known payload types, populated at startup
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    decoders: HashMap<EnvelopeType, Decoder>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type with the serializer used to write it
    pub fn register<M: Message, S: Serializer>(&mut self, serializer: S) -> &mut Self {
        let decoder: Decoder = Arc::new(move |bytes: &[u8]| {
            serializer.deserialize::<M>(bytes).map(|_| ())
        });
        self.decoders.insert(M::envelope_type(), decoder);
        self
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with<M: Message, S: Serializer>(mut self, serializer: S) -> Self {
        self.register::<M, S>(serializer);
        self
    }

    pub fn contains(&self, envelope_type: &EnvelopeType) -> bool {
        self.decoders.contains_key(envelope_type)
    }

    /// Deserialize `payload` as the shape registered for `envelope_type`
    pub fn verify(
        &self,
        envelope_type: &EnvelopeType,
        payload: &[u8],
    ) -> Result<(), SerializationError> {
        let decoder =
            self.decoders
                .get(envelope_type)
                .ok_or_else(|| SerializationError::UnknownType {
                    type_name: envelope_type.to_string(),
                })?;
        decoder(payload)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.decoders.keys().map(EnvelopeType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("PayloadRegistry")
            .field("types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonSerializer;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct InvoiceIssued {
        number: String,
        amount_cents: i64,
    }

    impl Message for InvoiceIssued {
        const TYPE: &'static str = "InvoiceIssued";
    }

    #[test]
    fn test_verify_registered_type() {
        let registry = PayloadRegistry::new().with::<InvoiceIssued, _>(JsonSerializer);
        let ty = EnvelopeType::new("InvoiceIssued");

        assert!(registry.contains(&ty));
        assert!(registry
            .verify(&ty, br#"{"number":"INV-1","amount_cents":1200}"#)
            .is_ok());
        assert!(matches!(
            registry.verify(&ty, br#"{"number":"INV-1"}"#),
            Err(SerializationError::Deserialize { .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let registry = PayloadRegistry::new();
        let err = registry
            .verify(&EnvelopeType::new("Nope"), b"{}")
            .unwrap_err();
        assert_eq!(
            err,
            SerializationError::UnknownType {
                type_name: "Nope".to_string()
            }
        );
        assert!(registry.is_empty());
    }
}
