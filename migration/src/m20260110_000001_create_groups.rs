use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Groups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Groups::Name)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(Groups::DisplayName))
                    .col(ColumnDef::new(Groups::Prefix).string().not_null().default(""))
                    .col(ColumnDef::new(Groups::Suffix).string().not_null().default(""))
                    .col(
                        ColumnDef::new(Groups::Weight)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(string_null(Groups::Parent))
                    .to_owned(),
            )
            .await?;

        // One row per explicit node; value is 1 (allow) or 0 (deny)
        manager
            .create_table(
                Table::create()
                    .table(GroupPermissions::Table)
                    .if_not_exists()
                    .col(string(GroupPermissions::GroupName))
                    .col(string(GroupPermissions::Node))
                    .col(big_integer(GroupPermissions::Value))
                    .primary_key(
                        Index::create()
                            .col(GroupPermissions::GroupName)
                            .col(GroupPermissions::Node),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(GroupPermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Groups::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Groups {
    Table,
    Name,
    DisplayName,
    Prefix,
    Suffix,
    Weight,
    Parent,
}

#[derive(DeriveIden)]
enum GroupPermissions {
    Table,
    GroupName,
    Node,
    Value,
}
