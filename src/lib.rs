pub mod shared {
    pub mod core {
        pub mod domain_event;
        pub mod errors;
        pub mod primitives;
        pub mod unit_of_work;
    }
    pub mod application {
        pub mod unit_of_work;
    }
    pub mod infrastructure {
        pub mod in_memory;
        pub mod outbox;
        pub mod postgres;
    }
    pub mod config;
    pub mod telemetry;
}

pub mod modules {
    pub mod wallets {
        pub mod core {
            pub mod events;
            pub mod ports;
            pub mod wallet;
        }
        pub mod use_cases {
            pub mod open_wallet {
                pub mod command;
                pub mod handler;
            }
            pub mod apply_wallet_command {
                pub mod command;
                pub mod handler;
            }
        }
        pub mod adapters {
            pub mod outbound {
                pub mod in_memory_wallet_repository;
                pub mod postgres_wallet_repository;
            }
        }
    }
    pub mod transactions {
        pub mod core {
            pub mod events;
            pub mod ports;
            pub mod transaction;
        }
        pub mod use_cases {
            pub mod record_transaction {
                pub mod command;
                pub mod handler;
            }
            pub mod process_transaction {
                pub mod handler;
            }
        }
        pub mod adapters {
            pub mod outbound {
                pub mod in_memory_transaction_repository;
                pub mod postgres_transaction_repository;
            }
        }
    }
}
