use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_payment_orders_table::Migration),
            Box::new(m20240601_000002_create_payment_audit_logs_table::Migration),
        ]
    }
}

mod m20240601_000001_create_payment_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_payment_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentOrders::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::MerchantOrderId)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PaymentOrders::GatewayOrderId).string().null())
                        .col(ColumnDef::new(PaymentOrders::RedirectUrl).text().null())
                        .col(ColumnDef::new(PaymentOrders::Amount).big_integer().not_null())
                        .col(ColumnDef::new(PaymentOrders::Status).string().not_null())
                        .col(ColumnDef::new(PaymentOrders::PaymentMethod).string().null())
                        .col(
                            ColumnDef::new(PaymentOrders::GatewayTransactionId)
                                .string()
                                .null(),
                        )
                        .col(ColumnDef::new(PaymentOrders::CustomerInfo).json().not_null())
                        .col(ColumnDef::new(PaymentOrders::SelectedItems).json().not_null())
                        .col(ColumnDef::new(PaymentOrders::Refunds).json().not_null())
                        .col(
                            ColumnDef::new(PaymentOrders::ExpireAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentOrders::CaseId).string().null())
                        .col(
                            ColumnDef::new(PaymentOrders::ProvisioningPending)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::Version)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Reconciler sweep scans open orders by staleness.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_orders_status_updated_at")
                        .table(PaymentOrders::Table)
                        .col(PaymentOrders::Status)
                        .col(PaymentOrders::UpdatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_orders_provisioning_pending")
                        .table(PaymentOrders::Table)
                        .col(PaymentOrders::ProvisioningPending)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum PaymentOrders {
        Table,
        Id,
        MerchantOrderId,
        GatewayOrderId,
        RedirectUrl,
        Amount,
        Status,
        PaymentMethod,
        GatewayTransactionId,
        CustomerInfo,
        SelectedItems,
        Refunds,
        ExpireAt,
        CaseId,
        ProvisioningPending,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_payment_audit_logs_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_payment_audit_logs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentAuditLogs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentAuditLogs::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentAuditLogs::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(PaymentAuditLogs::Sequence)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentAuditLogs::Event).string().not_null())
                        .col(
                            ColumnDef::new(PaymentAuditLogs::ResultingStatus)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentAuditLogs::Description).text().not_null())
                        .col(ColumnDef::new(PaymentAuditLogs::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(PaymentAuditLogs::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payment_audit_logs_order_id")
                                .from(PaymentAuditLogs::Table, PaymentAuditLogs::OrderId)
                                .to(PaymentOrders::Table, PaymentOrders::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_audit_logs_order_id_created_at")
                        .table(PaymentAuditLogs::Table)
                        .col(PaymentAuditLogs::OrderId)
                        .col(PaymentAuditLogs::CreatedAt)
                        .to_owned(),
                )
                .await?;

            // Also serialises concurrent appenders on the same order.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_audit_logs_order_id_sequence")
                        .table(PaymentAuditLogs::Table)
                        .col(PaymentAuditLogs::OrderId)
                        .col(PaymentAuditLogs::Sequence)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentAuditLogs::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentAuditLogs {
        Table,
        Id,
        OrderId,
        Sequence,
        Event,
        ResultingStatus,
        Description,
        Metadata,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum PaymentOrders {
        Table,
        Id,
    }
}
