// Engine scenarios over in-memory collaborators, plus the HTTP surface

mod api;
mod enrollment;
mod scenarios;
