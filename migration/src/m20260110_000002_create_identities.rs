use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Identities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Identities::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Identities::DisplayName).string().not_null().default(""))
                    .col(string(Identities::PrimaryGroup))
                    .col(ColumnDef::new(Identities::Prefix).string().not_null().default(""))
                    .col(ColumnDef::new(Identities::Suffix).string().not_null().default(""))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IdentityGroups::Table)
                    .if_not_exists()
                    .col(string(IdentityGroups::IdentityId))
                    .col(string(IdentityGroups::GroupName))
                    .col(big_integer_null(IdentityGroups::ExpiresAt))
                    .primary_key(
                        Index::create()
                            .col(IdentityGroups::IdentityId)
                            .col(IdentityGroups::GroupName),
                    )
                    .to_owned(),
            )
            .await?;

        // The sweep job deletes by expiry
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_identity_groups_expires_at")
                    .table(IdentityGroups::Table)
                    .col(IdentityGroups::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IdentityPermissions::Table)
                    .if_not_exists()
                    .col(string(IdentityPermissions::IdentityId))
                    .col(string(IdentityPermissions::Node))
                    .col(big_integer(IdentityPermissions::Value))
                    .primary_key(
                        Index::create()
                            .col(IdentityPermissions::IdentityId)
                            .col(IdentityPermissions::Node),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(IdentityPermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IdentityGroups::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Identities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Identities {
    Table,
    Id,
    DisplayName,
    PrimaryGroup,
    Prefix,
    Suffix,
}

#[derive(DeriveIden)]
enum IdentityGroups {
    Table,
    IdentityId,
    GroupName,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum IdentityPermissions {
    Table,
    IdentityId,
    Node,
    Value,
}
