//! Reply-to address resolution for outgoing messages.

use {async_trait::async_trait, tracing::debug};

use {
    conveyor_common::{ReceiveAddresses, RoutingOptions, headers},
    conveyor_pipeline::{Behavior, Next, OutgoingLogicalContext},
};

use crate::error::{Error, Result};

/// Writes the reply-to header on every outgoing message.
///
/// Precedence, first match wins:
/// 1. an explicit reply-to address on the options
/// 2. "reply to this instance": the instance-qualified address
/// 3. "reply to any instance": the shared endpoint address
/// 4. the public return address if configured, else the shared address
///
/// Setting both 2 and 3 is rejected regardless of the order they were set in.
pub struct ApplyReplyToAddressBehavior {
    addresses: Option<ReceiveAddresses>,
    public_return_address: Option<String>,
}

impl ApplyReplyToAddressBehavior {
    pub fn new(addresses: ReceiveAddresses, public_return_address: Option<String>) -> Self {
        Self {
            addresses: Some(addresses),
            public_return_address,
        }
    }

    /// A send-only endpoint has no queue to receive replies on; only an
    /// explicit reply-to address is written.
    pub fn send_only() -> Self {
        Self {
            addresses: None,
            public_return_address: None,
        }
    }

    /// Resolve the reply-to address for `options`, if any.
    pub fn resolve(&self, options: &RoutingOptions) -> Result<Option<String>> {
        let this_instance = options.is_routing_reply_to_this_instance();
        let any_instance = options.is_routing_reply_to_any_instance();
        if this_instance && any_instance {
            return Err(Error::ConflictingReplyOptions);
        }

        if let Some(explicit) = options.reply_to_route() {
            return Ok(Some(explicit.to_string()));
        }

        let Some(addresses) = &self.addresses else {
            if this_instance {
                return Err(Error::NoReceiveAddress {
                    option: "route reply to this instance",
                });
            }
            if any_instance {
                return Err(Error::NoReceiveAddress {
                    option: "route reply to any instance",
                });
            }
            return Ok(None);
        };

        if this_instance {
            return addresses
                .instance_receive_address()
                .map(|address| Some(address.to_string()))
                .ok_or(Error::NoInstanceDiscriminator);
        }
        if any_instance {
            return Ok(Some(addresses.main_receive_address().to_string()));
        }

        Ok(Some(
            self.public_return_address
                .clone()
                .unwrap_or_else(|| addresses.main_receive_address().to_string()),
        ))
    }
}

#[async_trait]
impl Behavior<OutgoingLogicalContext> for ApplyReplyToAddressBehavior {
    async fn invoke(
        &self,
        context: &mut OutgoingLogicalContext,
        next: Next<'_, OutgoingLogicalContext>,
    ) -> anyhow::Result<()> {
        if let Some(address) = self.resolve(&context.routing)? {
            debug!(message_id = %context.message_id(), reply_to = %address, "reply-to address applied");
            context
                .headers
                .insert(headers::REPLY_TO_ADDRESS.into(), address);
        }
        next.run(context).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, conveyor_common::SendOptions};

    fn scaled_out() -> ApplyReplyToAddressBehavior {
        ApplyReplyToAddressBehavior::new(
            ReceiveAddresses::with_instance("Sales", "Sales-blue"),
            None,
        )
    }

    #[test]
    fn defaults_to_the_shared_address() {
        let options = SendOptions::new();
        assert_eq!(
            scaled_out().resolve(options.routing()).unwrap().as_deref(),
            Some("Sales")
        );
    }

    #[test]
    fn public_return_address_overrides_the_default() {
        let behavior = ApplyReplyToAddressBehavior::new(
            ReceiveAddresses::new("Sales"),
            Some("Sales@gateway".into()),
        );
        let options = SendOptions::new();
        assert_eq!(
            behavior.resolve(options.routing()).unwrap().as_deref(),
            Some("Sales@gateway")
        );
    }

    #[test]
    fn explicit_reply_to_wins() {
        let mut options = SendOptions::new();
        options.route_reply_to("Billing").unwrap();
        options.route_reply_to_this_instance().unwrap();
        assert_eq!(
            scaled_out().resolve(options.routing()).unwrap().as_deref(),
            Some("Billing")
        );
    }

    #[test]
    fn this_instance_uses_instance_address() {
        let mut options = SendOptions::new();
        options.route_reply_to_this_instance().unwrap();
        assert_eq!(
            scaled_out().resolve(options.routing()).unwrap().as_deref(),
            Some("Sales-blue")
        );
    }

    #[test]
    fn this_instance_without_discriminator_fails() {
        let behavior = ApplyReplyToAddressBehavior::new(ReceiveAddresses::new("Sales"), None);
        let mut options = SendOptions::new();
        options.route_reply_to_this_instance().unwrap();
        assert!(matches!(
            behavior.resolve(options.routing()),
            Err(Error::NoInstanceDiscriminator)
        ));
    }

    #[test]
    fn any_instance_uses_shared_address_even_with_public_return_address() {
        let behavior = ApplyReplyToAddressBehavior::new(
            ReceiveAddresses::with_instance("Sales", "Sales-blue"),
            Some("Sales@gateway".into()),
        );
        let mut options = SendOptions::new();
        options.route_reply_to_any_instance().unwrap();
        assert_eq!(
            behavior.resolve(options.routing()).unwrap().as_deref(),
            Some("Sales")
        );
    }

    #[test]
    fn conflicting_reply_modes_fail_in_either_order() {
        let mut first = SendOptions::new();
        first.route_reply_to_this_instance().unwrap();
        first.route_reply_to_any_instance().unwrap();

        let mut second = SendOptions::new();
        second.route_reply_to_any_instance().unwrap();
        second.route_reply_to_this_instance().unwrap();

        for options in [first, second] {
            let err = scaled_out().resolve(options.routing()).unwrap_err();
            let message = err.to_string();
            assert!(message.contains("route reply to any instance"));
            assert!(message.contains("route reply to this instance"));
        }
    }

    #[test]
    fn send_only_endpoint_writes_no_default() {
        let behavior = ApplyReplyToAddressBehavior::send_only();
        assert_eq!(behavior.resolve(SendOptions::new().routing()).unwrap(), None);

        let mut options = SendOptions::new();
        options.route_reply_to_any_instance().unwrap();
        assert!(matches!(
            behavior.resolve(options.routing()),
            Err(Error::NoReceiveAddress { .. })
        ));
    }
}
