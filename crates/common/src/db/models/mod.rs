//! SeaORM entity models
//!
//! Database entities for the Librarium catalog and import job store

mod author;
mod book;
mod book_author;
mod book_genre;
mod genre;
mod import_job;

pub use book::{
    Entity as BookEntity,
    Model as Book,
    ActiveModel as BookActiveModel,
    Column as BookColumn,
};

pub use author::{
    Entity as AuthorEntity,
    Model as Author,
    ActiveModel as AuthorActiveModel,
    Column as AuthorColumn,
};

pub use genre::{
    Entity as GenreEntity,
    Model as Genre,
    ActiveModel as GenreActiveModel,
    Column as GenreColumn,
};

pub use book_author::{
    Entity as BookAuthorEntity,
    Model as BookAuthor,
    ActiveModel as BookAuthorActiveModel,
    Column as BookAuthorColumn,
};

pub use book_genre::{
    Entity as BookGenreEntity,
    Model as BookGenre,
    ActiveModel as BookGenreActiveModel,
    Column as BookGenreColumn,
};

pub use import_job::{
    Entity as ImportJobEntity,
    Model as ImportJob,
    ActiveModel as ImportJobActiveModel,
    Column as ImportJobColumn,
    JobStatus,
    RowError,
    RowErrors,
};
