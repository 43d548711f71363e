mod actions;
mod jobs;
