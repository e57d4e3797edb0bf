// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Baseline Configuration
//!
//! The built-in defaults every user configuration is merged on top of. The
//! baseline only populates the `defaults` and `redeliveries` sections; the
//! configurator consults `defaults.vhosts`, `defaults.publications` and
//! `defaults.subscriptions` when it expands each entity.

use serde_json::{json, Value};

/// Returns the baseline configuration tree.
pub fn baseline() -> Value {
    json!({
        "redeliveries": {
            "counters": {
                "stub": {},
                "inMemory": {},
            },
        },
        "defaults": {
            "vhosts": {
                "concurrency": 1,
                "connectionStrategy": "random",
                "publicationChannelPools": {
                    "regularPoolSize": 1,
                    "confirmPoolSize": 1,
                },
                "connection": {
                    "protocol": "amqp",
                    "hostname": "localhost",
                    "user": "guest",
                    "password": "guest",
                    "port": 5672,
                    "vhost": "",
                    "options": {
                        "heartbeat": 10,
                        "connection_timeout": 10000,
                        "channelMax": 100,
                    },
                    "socketOptions": {
                        "timeout": 10000,
                    },
                    "management": {
                        "protocol": "http",
                        "port": 15672,
                        "options": {},
                    },
                    "retry": {
                        "min": 1000,
                        "max": 60000,
                        "factor": 2.0,
                        "strategy": "exponential",
                    },
                },
                "exchanges": {
                    "assert": true,
                    "type": "topic",
                    "options": {
                        "durable": true,
                    },
                },
                "queues": {
                    "assert": true,
                    "options": {
                        "durable": true,
                    },
                },
                "bindings": {
                    "destinationType": "queue",
                    "bindingKey": "#",
                    "options": {},
                },
            },
            "publications": {
                "vhost": "/",
                "confirm": true,
                "options": {
                    "persistent": true,
                    "mandatory": true,
                },
            },
            "subscriptions": {
                "vhost": "/",
                "prefetch": 10,
                "deferCloseChannel": 10000,
                "redeliveries": {
                    "limit": 100,
                    "timeout": 1000,
                    "counter": "stub",
                },
                "retry": {
                    "min": 1000,
                    "max": 60000,
                    "factor": 2.0,
                    "strategy": "exponential",
                },
            },
            "redeliveries": {
                "counters": {
                    "stub": {},
                    "inMemory": {
                        "size": 1000,
                    },
                },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::merge::deep_merge;
    use serde_json::json;

    #[test]
    fn user_config_wins_over_baseline() {
        let merged = deep_merge(
            baseline(),
            json!({ "defaults": { "publications": { "confirm": false } } }),
        );
        assert_eq!(merged["defaults"]["publications"]["confirm"], json!(false));
        assert_eq!(merged["defaults"]["publications"]["vhost"], json!("/"));
    }

    #[test]
    fn baseline_registers_builtin_counters() {
        let value = baseline();
        assert!(value["redeliveries"]["counters"]["stub"].is_object());
        assert!(value["redeliveries"]["counters"]["inMemory"].is_object());
    }
}
