mod leaks;
mod lifecycle;
mod ordering;
mod production;
